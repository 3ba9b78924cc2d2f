//! Per-session ordered log fan-out.
//!
//! Each session gets a channel holding a bounded replay history plus a
//! `tokio::sync::broadcast` sender for live delivery. Publishing never waits
//! on subscribers; a subscriber that falls more than `subscriber_capacity`
//! events behind is handled by the configured [`OverflowPolicy`].
//!
//! Subscribing snapshots the history and registers for live events under the
//! same lock `publish` takes, so a subscriber sees every event exactly once.

use bskit_common::{LogEvent, SessionId};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::errors::PublishError;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// What happens to a subscriber whose queue overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// End the subscriber's stream, marked truncated.
    #[default]
    Disconnect,
    /// Skip the overwritten events, mark truncated, keep going.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverflowPolicy::Disconnect => "disconnect",
            OverflowPolicy::DropOldest => "drop-oldest",
        })
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!(
                "Invalid overflow policy '{}'. Valid values: disconnect, drop-oldest",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub history_capacity: usize,
    pub subscriber_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

struct SessionChannel {
    history: VecDeque<LogEvent>,
    /// `None` once closed.
    sender: Option<broadcast::Sender<LogEvent>>,
    next_sequence: u64,
    history_truncated: bool,
}

#[derive(Clone)]
pub struct LogEventBus {
    config: BusConfig,
    channels: Arc<DashMap<SessionId, Arc<Mutex<SessionChannel>>>>,
}

impl Default for LogEventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn lock(channel: &Mutex<SessionChannel>) -> MutexGuard<'_, SessionChannel> {
    channel.lock().unwrap_or_else(|e| e.into_inner())
}

impl LogEventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> BusConfig {
        self.config
    }

    /// Create the channel for `id`. Returns false if one already exists.
    pub fn open(&self, id: SessionId) -> bool {
        let mut created = false;
        self.channels.entry(id).or_insert_with(|| {
            created = true;
            let (sender, _) = broadcast::channel(self.config.subscriber_capacity.max(1));
            Arc::new(Mutex::new(SessionChannel {
                history: VecDeque::new(),
                sender: Some(sender),
                next_sequence: 0,
                history_truncated: false,
            }))
        });
        created
    }

    fn channel(&self, id: &SessionId) -> Option<Arc<Mutex<SessionChannel>>> {
        self.channels.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Append `event` to its session's history and hand it to live
    /// subscribers. The sequence must be exactly the next expected one.
    pub fn publish(&self, event: LogEvent) -> Result<(), PublishError> {
        let session_id = event.session_id;
        let channel = self
            .channel(&session_id)
            .ok_or(PublishError::UnknownSession(session_id))?;
        let mut channel = lock(&channel);

        if channel.sender.is_none() {
            return Err(PublishError::Closed(session_id));
        }
        if event.sequence != channel.next_sequence {
            return Err(PublishError::OutOfSequence {
                session_id,
                expected: channel.next_sequence,
                actual: event.sequence,
            });
        }

        channel.next_sequence += 1;
        channel.history.push_back(event.clone());
        while channel.history.len() > self.config.history_capacity {
            channel.history.pop_front();
            channel.history_truncated = true;
        }
        if let Some(sender) = &channel.sender {
            // No receivers is fine; history still has the event.
            let _ = sender.send(event);
        }
        Ok(())
    }

    /// Replay of retained history followed by live events. `None` if no
    /// channel exists for `id`.
    pub fn subscribe(&self, id: SessionId) -> Option<LogSubscription> {
        let channel = self.channel(&id)?;
        let channel = lock(&channel);
        Some(LogSubscription {
            session_id: id,
            backlog: channel.history.clone(),
            live: channel.sender.as_ref().map(|s| s.subscribe()),
            policy: self.config.overflow,
            truncated: channel.history_truncated,
            skipped: 0,
        })
    }

    /// End all subscriber streams once they have drained what is buffered.
    /// Returns true if this call closed the channel.
    pub fn close(&self, id: SessionId) -> bool {
        match self.channel(&id) {
            Some(channel) => lock(&channel).sender.take().is_some(),
            None => false,
        }
    }

    pub fn is_closed(&self, id: SessionId) -> Option<bool> {
        self.channel(&id).map(|c| lock(&c).sender.is_none())
    }

    /// Drop the channel and its history.
    pub fn remove(&self, id: SessionId) {
        self.channels.remove(&id);
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn history_len(&self, id: SessionId) -> usize {
        self.channel(&id).map(|c| lock(&c).history.len()).unwrap_or(0)
    }
}

/// One subscriber's view of a session's log: history first, then live.
pub struct LogSubscription {
    session_id: SessionId,
    backlog: VecDeque<LogEvent>,
    live: Option<broadcast::Receiver<LogEvent>>,
    policy: OverflowPolicy,
    truncated: bool,
    skipped: u64,
}

impl LogSubscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next event in sequence order; `None` when the stream has ended.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let live = self.live.as_mut()?;
        loop {
            match live.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.truncated = true;
                    self.skipped += n;
                    tracing::warn!(
                        session_id = %self.session_id,
                        skipped = n,
                        policy = %self.policy,
                        "log subscriber overflowed"
                    );
                    if self.policy == OverflowPolicy::Disconnect {
                        self.live = None;
                        return None;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.live = None;
                    return None;
                }
            }
        }
    }

    /// Whether this subscriber missed events (overflow or evicted history).
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Events dropped by overflow so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn into_stream(self) -> impl Stream<Item = LogEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bskit_common::{LogStream, SessionState};
    use futures::StreamExt;

    fn line(id: SessionId, seq: u64) -> LogEvent {
        LogEvent::new(id, seq, LogStream::Stdout, format!("line {}", seq))
    }

    fn small_bus(history: usize, subscriber: usize, overflow: OverflowPolicy) -> LogEventBus {
        LogEventBus::new(BusConfig {
            history_capacity: history,
            subscriber_capacity: subscriber,
            overflow,
        })
    }

    async fn drain(sub: &mut LogSubscription) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Some(event) = sub.recv().await {
            seqs.push(event.sequence);
        }
        seqs
    }

    #[tokio::test]
    async fn late_subscriber_gets_history_then_live() {
        let bus = LogEventBus::default();
        let id = SessionId::new();
        assert!(bus.open(id));
        bus.publish(line(id, 0)).unwrap();
        bus.publish(line(id, 1)).unwrap();

        let mut sub = bus.subscribe(id).unwrap();
        bus.publish(line(id, 2)).unwrap();
        bus.publish(LogEvent::terminal(id, 3, SessionState::Succeeded, "Build succeeded"))
            .unwrap();
        bus.close(id);

        assert_eq!(drain(&mut sub).await, vec![0, 1, 2, 3]);
        assert!(!sub.is_truncated());
    }

    #[tokio::test]
    async fn every_subscriber_sees_full_sequence() {
        let bus = LogEventBus::default();
        let id = SessionId::new();
        bus.open(id);
        let subs: Vec<_> = (0..3).map(|_| bus.subscribe(id).unwrap()).collect();
        for seq in 0..50 {
            bus.publish(line(id, seq)).unwrap();
        }
        bus.close(id);

        let expected: Vec<u64> = (0..50).collect();
        for mut sub in subs {
            assert_eq!(drain(&mut sub).await, expected);
        }
    }

    #[tokio::test]
    async fn subscribe_after_close_replays_and_ends() {
        let bus = LogEventBus::default();
        let id = SessionId::new();
        bus.open(id);
        bus.publish(line(id, 0)).unwrap();
        assert!(bus.close(id));
        assert!(!bus.close(id));

        let mut sub = bus.subscribe(id).unwrap();
        assert_eq!(drain(&mut sub).await, vec![0]);
    }

    #[test]
    fn rejects_unknown_closed_and_out_of_order() {
        let bus = LogEventBus::default();
        let id = SessionId::new();
        assert_eq!(bus.publish(line(id, 0)), Err(PublishError::UnknownSession(id)));

        bus.open(id);
        assert!(!bus.open(id));
        assert_eq!(
            bus.publish(line(id, 1)),
            Err(PublishError::OutOfSequence {
                session_id: id,
                expected: 0,
                actual: 1
            })
        );
        bus.publish(line(id, 0)).unwrap();
        assert!(matches!(
            bus.publish(line(id, 0)),
            Err(PublishError::OutOfSequence { .. })
        ));

        bus.close(id);
        assert_eq!(bus.publish(line(id, 1)), Err(PublishError::Closed(id)));
        assert_eq!(bus.is_closed(id), Some(true));
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected() {
        let bus = small_bus(100, 2, OverflowPolicy::Disconnect);
        let id = SessionId::new();
        bus.open(id);
        let mut sub = bus.subscribe(id).unwrap();
        for seq in 0..5 {
            bus.publish(line(id, seq)).unwrap();
        }

        assert!(sub.recv().await.is_none());
        assert!(sub.is_truncated());
        assert_eq!(sub.skipped(), 3);

        // Other subscribers and history are unaffected.
        let mut fresh = bus.subscribe(id).unwrap();
        bus.close(id);
        assert_eq!(drain(&mut fresh).await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn drop_oldest_skips_and_continues() {
        let bus = small_bus(100, 2, OverflowPolicy::DropOldest);
        let id = SessionId::new();
        bus.open(id);
        let mut sub = bus.subscribe(id).unwrap();
        for seq in 0..5 {
            bus.publish(line(id, seq)).unwrap();
        }
        bus.close(id);

        assert_eq!(drain(&mut sub).await, vec![3, 4]);
        assert!(sub.is_truncated());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = small_bus(3, 16, OverflowPolicy::Disconnect);
        let id = SessionId::new();
        bus.open(id);
        for seq in 0..5 {
            bus.publish(line(id, seq)).unwrap();
        }
        assert_eq!(bus.history_len(id), 3);
        bus.close(id);

        let mut sub = bus.subscribe(id).unwrap();
        assert!(sub.is_truncated());
        assert_eq!(drain(&mut sub).await, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn stream_adapter_yields_in_order() {
        let bus = LogEventBus::default();
        let id = SessionId::new();
        bus.open(id);
        for seq in 0..4 {
            bus.publish(line(id, seq)).unwrap();
        }
        bus.close(id);

        let texts: Vec<String> = bus
            .subscribe(id)
            .unwrap()
            .into_stream()
            .map(|e| e.text)
            .collect()
            .await;
        assert_eq!(texts, vec!["line 0", "line 1", "line 2", "line 3"]);
    }

    #[test]
    fn remove_drops_channel() {
        let bus = LogEventBus::default();
        let id = SessionId::new();
        bus.open(id);
        bus.remove(id);
        assert!(!bus.contains(id));
        assert!(bus.subscribe(id).is_none());
    }

    #[test]
    fn overflow_policy_parses() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("disconnect".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Disconnect));
        assert!("drop-newest".parse::<OverflowPolicy>().is_err());
    }
}
