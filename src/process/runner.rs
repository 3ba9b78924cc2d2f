use async_trait::async_trait;
use bskit_common::LogStream;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{CommandSpec, ExitOutcome, OutputChunk, ProcessRunner, RunningProcess};
use crate::errors::BuildError;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Spawns real OS processes through `tokio::process`.
///
/// Each child runs in its own process group (Unix) so a kill also reaches
/// the helpers it started. A supervisor task owns the `Child`, reaps it, and
/// kills the group when the handle asks for it or is dropped.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(&self, command: &CommandSpec) -> Result<RunningProcess, BuildError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.working_dir)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| BuildError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::debug!(pid = ?pid, program = %command.program, "spawned build process");

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_pipe(stdout, LogStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_pipe(stderr, LogStream::Stderr, tx.clone()));
        }
        drop(tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let token = CancellationToken::new();
        tokio::spawn(supervise(child, pid, token.clone(), exit_tx));

        Ok(RunningProcess::new(pid, rx, exit_rx, token))
    }
}

async fn read_pipe<R>(mut pipe: R, stream: LogStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    bytes: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(%stream, error = %e, "failed to read build output");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    token: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            terminate(&mut child, pid);
            child.wait().await
        }
        // Every handle dropped.
        _ = exit_tx.closed() => {
            terminate(&mut child, pid);
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from(status),
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "failed to reap build process");
            ExitOutcome::default()
        }
    };
    tracing::debug!(pid = ?pid, %outcome, "build process reaped");
    exit_tx.send_replace(Some(outcome));
}

fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid_t) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
        // SAFETY: negative pid targets the process group created at spawn.
        let rc = unsafe { libc::kill(-pid_t, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid = pid_t, error = %err, "failed to kill process group");
            }
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(pid = ?pid, error = %e, "start_kill after group kill");
    }
}
