//! External process supervision.
//!
//! A [`ProcessRunner`] turns a [`CommandSpec`] into a [`RunningProcess`]: a
//! handle made of three independent parts so the session pump can select
//! over them at once:
//!
//! - an output channel of raw [`OutputChunk`]s (not yet split into lines)
//! - an [`ExitWaiter`] resolving to the [`ExitOutcome`]
//! - a [`ProcessKiller`], cheap to clone, idempotent, safe after exit
//!
//! [`TokioProcessRunner`] is the real implementation. Tests build
//! `RunningProcess` values from channels via [`RunningProcess::new`].

pub mod command;
pub mod runner;

use async_trait::async_trait;
use bskit_common::LogStream;
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::errors::BuildError;

pub use command::{CommandSpec, CommandTemplate, slugify};
pub use runner::TokioProcessRunner;

/// Abstraction over process spawning for testability.
/// Real implementation: `TokioProcessRunner`.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Start `command`. Fails with `BuildError::Spawn` when the program is
    /// missing, the working directory is invalid, or the OS refuses.
    async fn spawn(&self, command: &CommandSpec) -> Result<RunningProcess, BuildError>;
}

/// A chunk of raw bytes read from one of the child's pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: LogStream,
    pub bytes: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stdout,
            bytes: bytes.into(),
        }
    }

    pub fn stderr(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stderr,
            bytes: bytes.into(),
        }
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    /// Terminating signal, Unix only.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Resolves once the process has been reaped.
pub struct ExitWaiter {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ExitWaiter {
    pub async fn wait(&mut self) -> ExitOutcome {
        let reported = self.rx.wait_for(Option::is_some).await.map(|outcome| *outcome);
        match reported {
            Ok(outcome) => outcome.unwrap_or_default(),
            // Supervisor went away without reporting.
            Err(_) => self.rx.borrow().unwrap_or_default(),
        }
    }

    /// Non-blocking check.
    pub fn outcome(&self) -> Option<ExitOutcome> {
        *self.rx.borrow()
    }
}

/// Requests termination of a process. Repeated calls and calls after the
/// process exited are no-ops.
#[derive(Clone)]
pub struct ProcessKiller {
    token: CancellationToken,
}

impl ProcessKiller {
    pub fn kill(&self) {
        self.token.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Handle to a spawned process.
pub struct RunningProcess {
    pid: Option<u32>,
    output: mpsc::Receiver<OutputChunk>,
    exit: ExitWaiter,
    killer: ProcessKiller,
}

impl RunningProcess {
    /// Assemble a handle from its parts. `output` must close once the
    /// process can no longer write; `exit` must eventually carry `Some`;
    /// `kill` is observed by whoever owns the actual process.
    pub fn new(
        pid: Option<u32>,
        output: mpsc::Receiver<OutputChunk>,
        exit: watch::Receiver<Option<ExitOutcome>>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            pid,
            output,
            exit: ExitWaiter { rx: exit },
            killer: ProcessKiller { token: kill },
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next raw chunk from either pipe; `None` once both pipes are closed.
    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.output.recv().await
    }

    pub async fn wait(&mut self) -> ExitOutcome {
        self.exit.wait().await
    }

    pub fn kill(&self) {
        self.killer.kill();
    }

    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    pub fn into_parts(self) -> (mpsc::Receiver<OutputChunk>, ExitWaiter, ProcessKiller) {
        (self.output, self.exit, self.killer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_outcome_display() {
        assert_eq!(ExitOutcome::exited(1).to_string(), "exited with code 1");
        assert_eq!(ExitOutcome::signaled(9).to_string(), "terminated by signal 9");
        assert_eq!(ExitOutcome::default().to_string(), "exited with unknown status");
    }

    #[test]
    fn only_zero_is_success() {
        assert!(ExitOutcome::exited(0).success());
        assert!(!ExitOutcome::exited(2).success());
        assert!(!ExitOutcome::signaled(15).success());
    }

    #[tokio::test]
    async fn assembled_handle_reports_parts() {
        let (tx, rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);
        let token = CancellationToken::new();
        let mut process = RunningProcess::new(Some(42), rx, exit_rx, token.clone());

        tx.send(OutputChunk::stdout("hello\n")).await.unwrap();
        drop(tx);
        exit_tx.send_replace(Some(ExitOutcome::exited(0)));

        assert_eq!(process.pid(), Some(42));
        assert_eq!(process.next_chunk().await, Some(OutputChunk::stdout("hello\n")));
        assert_eq!(process.next_chunk().await, None);
        assert_eq!(process.wait().await, ExitOutcome::exited(0));

        process.kill();
        process.kill();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn waiter_keeps_reported_outcome_after_supervisor_exits() {
        let (_tx, rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let mut process = RunningProcess::new(None, rx, exit_rx, CancellationToken::new());
        exit_tx.send_replace(Some(ExitOutcome::signaled(9)));
        drop(exit_tx);
        assert_eq!(process.wait().await, ExitOutcome::signaled(9));
        assert_eq!(process.wait().await, ExitOutcome::signaled(9));
    }

    #[tokio::test]
    async fn waiter_falls_back_when_supervisor_disappears() {
        let (_tx, rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let mut process = RunningProcess::new(None, rx, exit_rx, CancellationToken::new());
        drop(exit_tx);
        assert_eq!(process.wait().await, ExitOutcome::default());
    }
}
