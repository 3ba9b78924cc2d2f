use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::{SessionId, SessionState};

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by bskit itself (command echo, spawn errors, final verdict).
    System,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        })
    }
}

/// One line of build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub session_id: SessionId,
    pub sequence: u64,
    pub stream: LogStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Set on the last event of a session only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionState>,
}

impl LogEvent {
    pub fn new(session_id: SessionId, sequence: u64, stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            session_id,
            sequence,
            stream,
            text: text.into(),
            timestamp: Utc::now(),
            outcome: None,
        }
    }

    pub fn terminal(
        session_id: SessionId,
        sequence: u64,
        outcome: SessionState,
        text: impl Into<String>,
    ) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::new(session_id, sequence, LogStream::System, text)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}
