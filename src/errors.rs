//! Typed error hierarchy for bskit.
//!
//! - `BuildError`: everything `start`/`cancel`/`get`/`subscribe` can report
//!   synchronously to a caller
//! - `PublishError`: rejected log publications (logged, never surfaced)
//!
//! A build that runs and fails is not an error: it ends in the `Failed`
//! state with a `FailureReport`, and its log stream still completes normally.

use bskit_common::{BuildKey, SessionId};
use thiserror::Error;

/// Errors returned synchronously by build operations.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid build request: {0}")]
    Validation(String),

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("A build is already running for {key} (session {session_id})")]
    AlreadyRunning { key: BuildKey, session_id: SessionId },

    #[error("Build session {id} not found")]
    NotFound { id: SessionId },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    pub fn validation(message: impl Into<String>) -> Self {
        BuildError::Validation(message.into())
    }
}

/// Reasons the log bus refuses an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("No log channel open for session {0}")]
    UnknownSession(SessionId),

    #[error("Log channel for session {0} is closed")]
    Closed(SessionId),

    #[error("Out-of-order event for session {session_id}: expected sequence {expected}, got {actual}")]
    OutOfSequence {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },
}
