//! End-to-end tests for the log WebSocket over a real listener.
#![cfg(unix)]

use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use bskit::process::{CommandTemplate, TokioProcessRunner};
use bskit::registry::RegistrySettings;
use bskit::server::{LogFrame, serve};
use bskit::service::BuildService;
use bskit_common::{SessionId, SessionState};

struct TestServer {
    addr: SocketAddr,
    service: BuildService,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(script: &str) -> Self {
        let settings = RegistrySettings {
            template: CommandTemplate {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let service = BuildService::with_runner(Arc::new(TokioProcessRunner::new()), settings);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve(listener, service.clone(), false, async {
            let _ = rx.await;
        }));

        Self {
            addr,
            service,
            shutdown: Some(tx),
            handle,
        }
    }

    fn logs_url(&self, id: &str) -> String {
        format!("ws://{}/api/builds/{}/logs", self.addr, id)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// Read frames until the server closes the socket.
async fn read_frames(url: String) -> Vec<LogFrame> {
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    let mut frames = Vec::new();
    let read = async {
        while let Some(msg) = socket.next().await {
            match msg.unwrap() {
                Message::Text(text) => frames.push(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("socket did not close");
    frames
}

fn log_texts(frames: &[LogFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            LogFrame::Log(event) => Some(event.text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn viewers_stream_full_log_then_closed_frame() {
    let server = TestServer::start(
        "echo 'building for {platform}'; sleep 0.3; echo step two; echo 'Build completed successfully!'",
    )
    .await;
    let dir = TempDir::new().unwrap();
    let id = server
        .service
        .start_build(&dir.path().to_string_lossy(), "arm64")
        .await
        .unwrap();

    let first = tokio::spawn(read_frames(server.logs_url(&id.to_string())));
    let second = tokio::spawn(read_frames(server.logs_url(&id.to_string())));
    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert_eq!(first, second);
    let texts = log_texts(&first);
    assert!(texts[0].starts_with("$ sh -c"));
    assert_eq!(
        &texts[1..],
        &[
            "building for arm64",
            "step two",
            "Build completed successfully!",
            "Build succeeded"
        ]
    );
    assert_eq!(
        first.last(),
        Some(&LogFrame::Closed {
            state: Some(SessionState::Succeeded)
        })
    );

    // Late viewers still get the replay.
    let late = read_frames(server.logs_url(&id.to_string())).await;
    assert_eq!(late, first);

    server.stop().await;
}

#[tokio::test]
async fn unknown_session_is_rejected_before_upgrade() {
    let server = TestServer::start("true").await;

    for id in [SessionId::new().to_string(), "not-a-uuid".to_string()] {
        match connect_async(server.logs_url(&id).as_str()).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
            Err(other) => panic!("expected HTTP 404, got {}", other),
            Ok(_) => panic!("upgrade unexpectedly succeeded for {}", id),
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn shutdown_cancels_running_builds() {
    let server = TestServer::start("echo started; sleep 30").await;
    let dir = TempDir::new().unwrap();
    let id = server
        .service
        .start_build(&dir.path().to_string_lossy(), "amd64")
        .await
        .unwrap();
    let viewer = tokio::spawn(read_frames(server.logs_url(&id.to_string())));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let service = server.service.clone();
    server.stop().await;

    let status = service.session_status(id).unwrap();
    assert_eq!(status.state, SessionState::Cancelled);

    let frames = viewer.await.unwrap();
    let texts = log_texts(&frames);
    assert!(texts.contains(&"started".to_string()));
    assert_eq!(texts.last().map(String::as_str), Some("Build cancelled"));
}
