use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use bskit_common::{LogEvent, SessionId, SessionState};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::api::{ApiError, SharedState, parse_session_id};
use crate::bus::LogSubscription;
use crate::service::BuildService;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LogFrame {
    Log(LogEvent),
    /// This viewer missed events (overflow or evicted history).
    Truncated { skipped: u64 },
    /// The log stream ended; `state` is the session state at that moment.
    Closed { state: Option<SessionState> },
}

// ── WebSocket handler ────────────────────────────────────────────────

/// `GET /api/builds/{id}/logs`. Unknown sessions get a plain 404 before
/// any upgrade happens.
pub async fn logs_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let subscription = match parse_session_id(&id)
        .and_then(|id| state.service.subscribe_logs(id).map_err(ApiError::from))
    {
        Ok(subscription) => subscription,
        Err(e) => return e.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let service = state.service.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, subscription, service))
}

async fn handle_socket(socket: WebSocket, subscription: LogSubscription, service: BuildService) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription, service).await;
}

fn frame(frame: &LogFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize log frame");
            None
        }
    }
}

/// Forward one subscription to the socket with ping/pong keepalive.
///
/// Log frames go out in sequence order. When the subscription ends, a
/// `Truncated` frame (if anything was missed) and a `Closed` frame follow,
/// then a close frame. A client that disconnects early just drops its
/// subscription; the build is unaffected.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: LogSubscription,
    service: BuildService,
) {
    let session_id: SessionId = subscription.session_id();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;
    let mut stream_ended = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Some(msg) = frame(&LogFrame::Log(event)) else { continue };
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        stream_ended = true;
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if stream_ended {
        let mut trailer = Vec::new();
        if subscription.is_truncated() {
            trailer.push(LogFrame::Truncated {
                skipped: subscription.skipped(),
            });
        }
        trailer.push(LogFrame::Closed {
            state: service.session_status(session_id).ok().map(|s| s.state),
        });
        for msg in trailer.iter().filter_map(frame) {
            if sender.send(msg).await.is_err() {
                return;
            }
        }
    } else {
        tracing::debug!(session_id = %session_id, "log viewer disconnected");
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged() {
        let event = LogEvent::new(SessionId::new(), 0, bskit_common::LogStream::Stdout, "hello");
        let json = serde_json::to_value(LogFrame::Log(event)).unwrap();
        assert_eq!(json["type"], "Log");
        assert_eq!(json["data"]["text"], "hello");
        assert_eq!(json["data"]["sequence"], 0);

        let json = serde_json::to_value(LogFrame::Truncated { skipped: 4 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "Truncated", "data": {"skipped": 4}}));

        let json = serde_json::to_value(LogFrame::Closed {
            state: Some(SessionState::Failed),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "Closed", "data": {"state": "failed"}}));
    }
}
