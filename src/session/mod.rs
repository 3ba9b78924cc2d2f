//! One build session: state machine plus the task body that spawns the
//! process and pumps its output onto the log bus.
//!
//! ```text
//! Pending ──spawn ok──▶ Running ──sentinel / exit──▶ Succeeded | Failed
//!    │  └──spawn err──▶ Failed          │
//!    └──────cancel──────────────────────┴──cancel──▶ Cancelled
//! ```
//!
//! The first transition into a terminal state wins. Whatever wins, exactly
//! one terminal `system` event is published and the session's bus channel
//! is closed.

pub mod completion;
pub mod lines;

use bskit_common::{
    BuildSpec, FailureReport, LogEvent, LogStream, SessionId, SessionState, SessionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::LogEventBus;
use crate::errors::BuildError;
use crate::process::{CommandSpec, ExitOutcome, OutputChunk, ProcessRunner, RunningProcess};

pub use completion::{Completion, CompletionMatcher};
pub use lines::LineSplitter;

pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(2000);
pub const DEFAULT_FAILURE_TAIL_LINES: usize = 20;
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

const CANCELLED_MESSAGE: &str = "Build cancelled";
const SUCCEEDED_MESSAGE: &str = "Build succeeded";

/// Per-session runtime knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Kill and fail the build after this long. No limit when `None`.
    pub timeout: Option<Duration>,
    /// How long a process may linger after its sentinel, and how long output
    /// is drained after the process exits.
    pub exit_grace: Duration,
    pub failure_tail_lines: usize,
    pub max_line_bytes: usize,
    /// Treat exit code 0 without a success sentinel as a failure.
    pub require_success_marker: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            exit_grace: DEFAULT_EXIT_GRACE,
            failure_tail_lines: DEFAULT_FAILURE_TAIL_LINES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            require_success_marker: false,
        }
    }
}

#[derive(Debug)]
struct SessionRecord {
    state: SessionState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    failure: Option<FailureReport>,
}

pub struct BuildSession {
    id: SessionId,
    spec: BuildSpec,
    command: CommandSpec,
    record: Mutex<SessionRecord>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl BuildSession {
    pub fn new(spec: BuildSpec, command: CommandSpec) -> Self {
        Self {
            id: SessionId::new(),
            spec,
            command,
            record: Mutex::new(SessionRecord {
                state: SessionState::Pending,
                started_at: Utc::now(),
                ended_at: None,
                exit_code: None,
                failure: None,
            }),
            cancel: CancellationToken::new(),
            done: watch::channel(false).0,
        }
    }

    fn record(&self) -> MutexGuard<'_, SessionRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn state(&self) -> SessionState {
        self.record().state
    }

    pub fn status(&self) -> SessionStatus {
        let record = self.record();
        SessionStatus {
            id: self.id,
            spec: self.spec.clone(),
            state: record.state,
            exit_code: record.exit_code,
            started_at: record.started_at,
            ended_at: record.ended_at,
            failure: record.failure.clone(),
        }
    }

    /// Apply `next` if legal from the current state. Returns whether it was
    /// applied; terminal states are never left.
    pub(crate) fn try_transition(&self, next: SessionState, failure: Option<FailureReport>) -> bool {
        let mut record = self.record();
        if !record.state.can_transition_to(next) {
            return false;
        }
        record.state = next;
        if next.is_terminal() {
            record.ended_at = Some(Utc::now());
            record.failure = failure;
        }
        true
    }

    pub(crate) fn record_exit(&self, code: Option<i32>) {
        self.record().exit_code = code;
    }

    /// Move to `Cancelled` and signal the session task. Returns false when
    /// the session was already terminal (a no-op, not an error).
    pub fn cancel(&self) -> bool {
        if self.try_transition(SessionState::Cancelled, None) {
            self.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the session task has fully finished.
    pub async fn finished(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn mark_finished(&self) {
        self.done.send_replace(true);
    }
}

/// Assigns sequence numbers and publishes one session's events.
pub(crate) struct LogEmitter {
    session_id: SessionId,
    bus: LogEventBus,
    next_sequence: u64,
    terminated: bool,
}

impl LogEmitter {
    pub(crate) fn new(session_id: SessionId, bus: LogEventBus) -> Self {
        Self {
            session_id,
            bus,
            next_sequence: 0,
            terminated: false,
        }
    }

    pub(crate) fn emit(&mut self, stream: LogStream, text: impl Into<String>) {
        if self.terminated {
            return;
        }
        let event = LogEvent::new(self.session_id, self.next_sequence, stream, text);
        self.publish(event);
    }

    /// Publish the final event and close the channel. Only the first call
    /// has any effect.
    pub(crate) fn emit_terminal(&mut self, outcome: SessionState, text: impl Into<String>) {
        if self.terminated {
            return;
        }
        let event = LogEvent::terminal(self.session_id, self.next_sequence, outcome, text);
        self.publish(event);
        self.terminated = true;
        self.bus.close(self.session_id);
    }

    fn publish(&mut self, event: LogEvent) {
        match self.bus.publish(event) {
            Ok(()) => self.next_sequence += 1,
            Err(e) => tracing::warn!(session_id = %self.session_id, error = %e, "log event rejected"),
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Everything the session task needs besides the session itself.
pub(crate) struct SessionContext {
    pub runner: Arc<dyn ProcessRunner>,
    pub bus: LogEventBus,
    pub matcher: Arc<CompletionMatcher>,
    pub config: SessionConfig,
}

/// Session task body. Reports the spawn result through `reply` as soon as
/// it is known, then supervises the process until the session is terminal
/// and the process is reaped.
pub(crate) async fn run(
    session: Arc<BuildSession>,
    ctx: SessionContext,
    reply: oneshot::Sender<Result<(), BuildError>>,
) {
    let mut emitter = LogEmitter::new(session.id(), ctx.bus.clone());

    let spawned = tokio::select! {
        biased;
        _ = session.cancel.cancelled() => None,
        result = ctx.runner.spawn(session.command()) => Some(result),
    };

    let process = match spawned {
        None => {
            tracing::info!(session_id = %session.id(), "build cancelled before spawn");
            emitter.emit_terminal(SessionState::Cancelled, CANCELLED_MESSAGE);
            let _ = reply.send(Ok(()));
            return;
        }
        Some(Err(err)) => {
            tracing::error!(session_id = %session.id(), error = %err, "failed to start build");
            let reason = err.to_string();
            let failure = FailureReport {
                reason: reason.clone(),
                exit_code: None,
                tail: Vec::new(),
            };
            if session.try_transition(SessionState::Failed, Some(failure)) {
                emitter.emit_terminal(SessionState::Failed, format!("Build failed: {}", reason));
            } else {
                emitter.emit_terminal(SessionState::Cancelled, CANCELLED_MESSAGE);
            }
            let _ = reply.send(Err(err));
            return;
        }
        Some(Ok(process)) => process,
    };

    if session.try_transition(SessionState::Running, None) {
        emitter.emit(LogStream::System, format!("$ {}", session.command().display()));
    }
    let _ = reply.send(Ok(()));

    let pump = Pump::new(&session, emitter, &ctx.matcher, &ctx.config);
    pump.drive(process).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Output pump for one running process.
struct Pump<'a> {
    session: &'a BuildSession,
    emitter: LogEmitter,
    matcher: &'a CompletionMatcher,
    config: &'a SessionConfig,
    splitter: LineSplitter,
    tail: VecDeque<String>,
}

impl<'a> Pump<'a> {
    fn new(
        session: &'a BuildSession,
        emitter: LogEmitter,
        matcher: &'a CompletionMatcher,
        config: &'a SessionConfig,
    ) -> Self {
        Self {
            session,
            emitter,
            matcher,
            config,
            splitter: LineSplitter::new(config.max_line_bytes),
            tail: VecDeque::with_capacity(config.failure_tail_lines),
        }
    }

    async fn drive(mut self, process: RunningProcess) {
        let (mut output, mut exit, killer) = process.into_parts();
        let timeout_at = self.config.timeout.map(|t| Instant::now() + t);

        let mut output_open = true;
        let mut exited: Option<ExitOutcome> = None;
        let mut killed = false;
        let mut timed_out = false;
        // Set once a sentinel concluded the session and the process still runs.
        let mut kill_at: Option<Instant> = None;
        // Set once the process exited and output may still be held open by
        // orphaned grandchildren.
        let mut give_up_at: Option<Instant> = None;

        while output_open || exited.is_none() {
            tokio::select! {
                biased;
                _ = self.session.cancel.cancelled(), if !killed => {
                    killer.kill();
                    killed = true;
                }
                _ = sleep_until(timeout_at), if !killed && !self.emitter.is_terminated() => {
                    tracing::warn!(session_id = %self.session.id(), "build timed out");
                    timed_out = true;
                    killer.kill();
                    killed = true;
                }
                _ = sleep_until(kill_at), if !killed => {
                    tracing::debug!(session_id = %self.session.id(), "process outlived its sentinel, killing");
                    killer.kill();
                    killed = true;
                }
                _ = sleep_until(give_up_at) => {
                    tracing::debug!(session_id = %self.session.id(), "output still open after exit, giving up");
                    break;
                }
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => self.push(chunk),
                    None => output_open = false,
                },
                outcome = exit.wait(), if exited.is_none() => {
                    self.session.record_exit(outcome.code);
                    exited = Some(outcome);
                    give_up_at = Some(Instant::now() + self.config.exit_grace);
                }
            }

            if self.emitter.is_terminated() && exited.is_none() && kill_at.is_none() {
                kill_at = Some(Instant::now() + self.config.exit_grace);
            }
        }

        for stream in [LogStream::Stdout, LogStream::Stderr] {
            if let Some(line) = self.splitter.finish(stream) {
                self.line(stream, line);
            }
        }

        if !self.emitter.is_terminated() {
            self.conclude_after_exit(exited.unwrap_or_default(), timed_out);
        }
    }

    fn push(&mut self, chunk: OutputChunk) {
        for line in self.splitter.push(chunk.stream, &chunk.bytes) {
            self.line(chunk.stream, line);
        }
    }

    fn line(&mut self, stream: LogStream, text: String) {
        if self.emitter.is_terminated() {
            return;
        }
        if self.config.failure_tail_lines > 0 {
            if self.tail.len() == self.config.failure_tail_lines {
                self.tail.pop_front();
            }
            self.tail.push_back(text.clone());
        }
        let completion = self.matcher.detect(&text);
        self.emitter.emit(stream, text);

        // A cancelled session ignores late sentinels.
        if self.session.state().is_terminal() {
            return;
        }
        match completion {
            Some(Completion::Success) => {
                self.conclude(SessionState::Succeeded, SUCCEEDED_MESSAGE.to_string(), None);
            }
            Some(Completion::Failure { line }) => {
                let reason = format!("failure marker detected: {}", line);
                let failure = self.failure(reason.clone(), None);
                self.conclude(SessionState::Failed, format!("Build failed: {}", reason), Some(failure));
            }
            None => {}
        }
    }

    fn conclude_after_exit(&mut self, outcome: ExitOutcome, timed_out: bool) {
        if timed_out && let Some(limit) = self.config.timeout {
            let reason = format!("timed out after {:?}", limit);
            let failure = self.failure(reason.clone(), outcome.code);
            self.conclude(SessionState::Failed, format!("Build failed: {}", reason), Some(failure));
        } else if outcome.success() && !self.config.require_success_marker {
            self.conclude(SessionState::Succeeded, SUCCEEDED_MESSAGE.to_string(), None);
        } else {
            let reason = if outcome.success() {
                "process exited without a success marker".to_string()
            } else {
                format!("process {}", outcome)
            };
            let failure = self.failure(reason.clone(), outcome.code);
            self.conclude(SessionState::Failed, format!("Build failed: {}", reason), Some(failure));
        }
    }

    fn failure(&self, reason: String, exit_code: Option<i32>) -> FailureReport {
        FailureReport {
            reason,
            exit_code,
            tail: self.tail.iter().cloned().collect(),
        }
    }

    fn conclude(&mut self, outcome: SessionState, message: String, failure: Option<FailureReport>) {
        if self.session.try_transition(outcome, failure) {
            self.emitter.emit_terminal(outcome, message);
        } else if self.session.state() == SessionState::Cancelled {
            self.emitter.emit_terminal(SessionState::Cancelled, CANCELLED_MESSAGE);
        }
    }
}
