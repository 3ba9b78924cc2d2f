//! Session registry: at most one active session per `BuildKey`.
//!
//! Admission goes through a `DashMap` entry for the key, so concurrent
//! starts for one key race on a single shard lock and exactly one wins.
//! Sessions for different keys never contend. Each admitted session runs in
//! its own task; when that task ends the registry releases the key, moves
//! the session to a bounded ring of recently finished sessions, and only
//! then wakes `wait` callers.

use anyhow::anyhow;
use bskit_common::{BuildKey, BuildSpec, SessionId, SessionStatus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::bus::{BusConfig, LogEventBus, LogSubscription};
use crate::errors::BuildError;
use crate::process::{CommandTemplate, ProcessRunner};
use crate::session::{self, BuildSession, CompletionMatcher, SessionConfig, SessionContext};

pub const DEFAULT_RETAIN_FINISHED: usize = 32;

/// Everything the registry needs to turn a `BuildSpec` into a running build.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub template: CommandTemplate,
    pub matcher: CompletionMatcher,
    pub session: SessionConfig,
    pub bus: BusConfig,
    /// Finished sessions kept for status and log replay.
    pub retain_finished: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            template: CommandTemplate::default(),
            matcher: CompletionMatcher::default(),
            session: SessionConfig::default(),
            bus: BusConfig::default(),
            retain_finished: DEFAULT_RETAIN_FINISHED,
        }
    }
}

struct Inner {
    runner: Arc<dyn ProcessRunner>,
    template: CommandTemplate,
    matcher: Arc<CompletionMatcher>,
    session_config: SessionConfig,
    bus: LogEventBus,
    active: DashMap<BuildKey, SessionId>,
    sessions: DashMap<SessionId, Arc<BuildSession>>,
    recent: Mutex<VecDeque<Arc<BuildSession>>>,
    retain_finished: usize,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                template: settings.template,
                matcher: Arc::new(settings.matcher),
                session_config: settings.session,
                bus: LogEventBus::new(settings.bus),
                active: DashMap::new(),
                sessions: DashMap::new(),
                recent: Mutex::new(VecDeque::new()),
                retain_finished: settings.retain_finished,
            }),
        }
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<Arc<BuildSession>>> {
        self.inner.recent.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bus(&self) -> &LogEventBus {
        &self.inner.bus
    }

    /// Admit and launch a build for `spec`.
    ///
    /// Returns once the process has been spawned (or the session was
    /// cancelled while pending). A spawn failure is returned as
    /// `BuildError::Spawn` after the failed session has been released.
    pub async fn start(&self, spec: BuildSpec) -> Result<SessionId, BuildError> {
        let key = spec.key();
        let command = self.inner.template.render(&spec);
        let session = Arc::new(BuildSession::new(spec, command));
        let id = session.id();

        match self.inner.active.entry(key.clone()) {
            Entry::Occupied(mut holder) => {
                let previous = *holder.get();
                if self.is_live(previous) {
                    return Err(BuildError::AlreadyRunning {
                        key,
                        session_id: previous,
                    });
                }
                // The holder is terminal and only reaping remains.
                tracing::debug!(session_id = %previous, key = %key, "taking over key from finished session");
                self.inner.bus.open(id);
                self.inner.sessions.insert(id, Arc::clone(&session));
                holder.insert(id);
            }
            Entry::Vacant(slot) => {
                self.inner.bus.open(id);
                self.inner.sessions.insert(id, Arc::clone(&session));
                slot.insert(id);
            }
        }
        tracing::info!(session_id = %id, key = %key, "build session admitted");

        let ctx = SessionContext {
            runner: Arc::clone(&self.inner.runner),
            bus: self.inner.bus.clone(),
            matcher: Arc::clone(&self.inner.matcher),
            config: self.inner.session_config.clone(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let registry = self.clone();
        let task_session = Arc::clone(&session);
        tokio::spawn(async move {
            session::run(Arc::clone(&task_session), ctx, reply_tx).await;
            registry.finish(&task_session);
        });

        match reply_rx.await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(err)) => {
                session.finished().await;
                Err(err)
            }
            Err(_) => Err(BuildError::Other(anyhow!(
                "session {} ended without reporting its spawn result",
                id
            ))),
        }
    }

    /// Release a finished session. Runs exactly once per session, from its
    /// own task.
    fn finish(&self, session: &Arc<BuildSession>) {
        let id = session.id();
        let key = session.spec().key();

        let evicted: Vec<SessionId> = {
            let mut recent = self.recent();
            recent.push_back(Arc::clone(session));
            let excess = recent.len().saturating_sub(self.inner.retain_finished);
            recent.drain(..excess).map(|s| s.id()).collect()
        };
        self.inner.sessions.remove(&id);
        self.inner.active.remove_if(&key, |_, holder| *holder == id);
        self.inner.bus.close(id);
        for old in evicted {
            self.inner.bus.remove(old);
        }

        let status = session.status();
        tracing::info!(
            session_id = %id,
            key = %key,
            state = %status.state,
            exit_code = ?status.exit_code,
            "build session finished"
        );
        session.mark_finished();
    }

    fn lookup(&self, id: SessionId) -> Option<Arc<BuildSession>> {
        if let Some(session) = self.inner.sessions.get(&id) {
            return Some(Arc::clone(session.value()));
        }
        self.recent().iter().find(|s| s.id() == id).cloned()
    }

    pub fn get(&self, id: SessionId) -> Result<SessionStatus, BuildError> {
        self.lookup(id)
            .map(|s| s.status())
            .ok_or(BuildError::NotFound { id })
    }

    /// Cancel a session. Unknown ids are `NotFound`; terminal sessions are
    /// left alone.
    pub fn cancel(&self, id: SessionId) -> Result<(), BuildError> {
        let session = self.lookup(id).ok_or(BuildError::NotFound { id })?;
        if session.cancel() {
            tracing::info!(session_id = %id, "build session cancelled");
        }
        Ok(())
    }

    pub fn subscribe(&self, id: SessionId) -> Result<LogSubscription, BuildError> {
        self.inner
            .bus
            .subscribe(id)
            .ok_or(BuildError::NotFound { id })
    }

    /// Resolves with the final status once the session task has finished.
    pub async fn wait(&self, id: SessionId) -> Result<SessionStatus, BuildError> {
        let session = self.lookup(id).ok_or(BuildError::NotFound { id })?;
        session.finished().await;
        Ok(session.status())
    }

    /// Whether `id` still holds its key: known and not yet terminal.
    fn is_live(&self, id: SessionId) -> bool {
        self.inner
            .sessions
            .get(&id)
            .is_some_and(|session| !session.state().is_terminal())
    }

    /// The non-terminal session holding `key`, if any.
    pub fn active_for(&self, key: &BuildKey) -> Option<SessionId> {
        let id = self.inner.active.get(key).map(|id| *id.value())?;
        self.is_live(id).then_some(id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Active sessions, oldest first.
    pub fn list(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        statuses.sort_by_key(|s| s.started_at);
        statuses
    }

    /// Recently finished sessions, oldest first.
    pub fn finished(&self) -> Vec<SessionStatus> {
        self.recent().iter().map(|s| s.status()).collect()
    }

    /// Cancel every active session. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.iter().filter(|s| s.cancel()).count()
    }

    /// Cancel everything and wait for the session tasks to wind down.
    pub async fn shutdown(&self) {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelling active builds for shutdown");
        }
        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.finished().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TokioProcessRunner;
    use bskit_common::{Platform, SessionState};

    fn sh_registry(script: &str, retain_finished: usize) -> SessionRegistry {
        let settings = RegistrySettings {
            template: CommandTemplate {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
                ..Default::default()
            },
            retain_finished,
            ..Default::default()
        };
        SessionRegistry::new(Arc::new(TokioProcessRunner::new()), settings)
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let registry = sh_registry("true", 4);
        let id = SessionId::new();
        assert!(matches!(registry.get(id), Err(BuildError::NotFound { .. })));
        assert!(matches!(registry.cancel(id), Err(BuildError::NotFound { .. })));
        assert!(matches!(registry.subscribe(id), Err(BuildError::NotFound { .. })));
        assert!(matches!(registry.wait(id).await, Err(BuildError::NotFound { .. })));
    }

    #[tokio::test]
    async fn finished_session_stays_queryable_until_evicted() {
        let registry = sh_registry("echo hi", 1);
        let dir = tempfile::tempdir().unwrap();
        let first = registry
            .start(BuildSpec::new(dir.path(), Platform::Arm64))
            .await
            .unwrap();
        let status = registry.wait(first).await.unwrap();
        assert_eq!(status.state, SessionState::Succeeded);
        assert_eq!(status.exit_code, Some(0));
        assert!(registry.subscribe(first).is_ok());
        assert!(registry.cancel(first).is_ok());

        let second = registry
            .start(BuildSpec::new(dir.path(), Platform::Amd64))
            .await
            .unwrap();
        registry.wait(second).await.unwrap();

        assert!(matches!(registry.get(first), Err(BuildError::NotFound { .. })));
        assert!(!registry.bus().contains(first));
        assert_eq!(registry.finished().len(), 1);
    }

    #[tokio::test]
    async fn key_is_released_on_finish() {
        let registry = sh_registry("exit 0", 4);
        let dir = tempfile::tempdir().unwrap();
        let spec = BuildSpec::new(dir.path(), Platform::Amd64);
        let id = registry.start(spec.clone()).await.unwrap();
        registry.wait(id).await.unwrap();
        assert_eq!(registry.active_for(&spec.key()), None);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn cancelled_session_frees_key_before_reaping() {
        let registry = sh_registry("sleep 30", 4);
        let dir = tempfile::tempdir().unwrap();
        let spec = BuildSpec::new(dir.path(), Platform::Amd64);
        let first = registry.start(spec.clone()).await.unwrap();

        registry.cancel(first).unwrap();
        assert_eq!(registry.active_for(&spec.key()), None);
        let second = registry.start(spec.clone()).await.unwrap();
        assert_eq!(registry.active_for(&spec.key()), Some(second));

        // Reaping the first session must not release the second one's key.
        registry.wait(first).await.unwrap();
        assert_eq!(registry.active_for(&spec.key()), Some(second));
        assert!(matches!(
            registry.start(spec.clone()).await,
            Err(BuildError::AlreadyRunning { session_id, .. }) if session_id == second
        ));

        registry.cancel(second).unwrap();
        registry.wait(second).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_running_builds() {
        let registry = sh_registry("sleep 30", 4);
        let dir = tempfile::tempdir().unwrap();
        let id = registry
            .start(BuildSpec::new(dir.path(), Platform::Arm64))
            .await
            .unwrap();
        assert_eq!(registry.list().len(), 1);

        registry.shutdown().await;
        let status = registry.get(id).unwrap();
        assert_eq!(status.state, SessionState::Cancelled);
        assert_eq!(registry.active_count(), 0);
    }
}
