//! Boundary operations used by the CLI and the HTTP layer.
//!
//! `BuildService` turns untrusted strings into a validated `BuildSpec` and
//! forwards to the registry. Everything else is a thin pass-through so every
//! front end sees the same errors.

use anyhow::Result;
use bskit_common::{BuildSpec, Platform, SessionId, SessionStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bus::LogSubscription;
use crate::config::BskitToml;
use crate::errors::BuildError;
use crate::process::{ProcessRunner, TokioProcessRunner};
use crate::registry::{RegistrySettings, SessionRegistry};

/// Validate raw request fields into a `BuildSpec`.
///
/// The directory must be non-empty, exist, be a directory and be listable.
/// It is canonicalised so different spellings share one `BuildKey`.
pub fn validate_request(target_directory: &str, platform: &str) -> Result<BuildSpec, BuildError> {
    let target_directory = target_directory.trim();
    if target_directory.is_empty() {
        return Err(BuildError::validation("No directory selected"));
    }
    let platform: Platform = platform
        .parse()
        .map_err(|e: bskit_common::ParsePlatformError| BuildError::validation(e.to_string()))?;

    let directory = canonical_directory(Path::new(target_directory))?;
    Ok(BuildSpec::new(directory, platform))
}

fn canonical_directory(path: &Path) -> Result<PathBuf, BuildError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BuildError::validation(format!(
                "Directory {} does not exist",
                path.display()
            )));
        }
        Err(e) => {
            return Err(BuildError::validation(format!(
                "Cannot access {}: {}",
                path.display(),
                e
            )));
        }
    };
    if !metadata.is_dir() {
        return Err(BuildError::validation(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    std::fs::read_dir(path).map_err(|e| {
        BuildError::validation(format!("Directory {} is not readable: {}", path.display(), e))
    })?;
    std::fs::canonicalize(path).map_err(|e| {
        BuildError::validation(format!("Cannot resolve {}: {}", path.display(), e))
    })
}

#[derive(Clone)]
pub struct BuildService {
    registry: SessionRegistry,
}

impl BuildService {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn with_runner(runner: Arc<dyn ProcessRunner>, settings: RegistrySettings) -> Self {
        Self::new(SessionRegistry::new(runner, settings))
    }

    /// Service backed by real processes, configured from `bskit.toml`.
    pub fn from_config(config: &BskitToml) -> Result<Self> {
        let settings = config.registry_settings()?;
        Ok(Self::with_runner(Arc::new(TokioProcessRunner::new()), settings))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn start_build(
        &self,
        target_directory: &str,
        platform: &str,
    ) -> Result<SessionId, BuildError> {
        let spec = validate_request(target_directory, platform).inspect_err(|e| {
            tracing::debug!(directory = target_directory, platform, error = %e, "rejected build request");
        })?;
        self.registry.start(spec).await
    }

    pub fn subscribe_logs(&self, id: SessionId) -> Result<LogSubscription, BuildError> {
        self.registry.subscribe(id)
    }

    pub fn cancel_build(&self, id: SessionId) -> Result<(), BuildError> {
        self.registry.cancel(id)
    }

    pub fn session_status(&self, id: SessionId) -> Result<SessionStatus, BuildError> {
        self.registry.get(id)
    }

    pub async fn wait(&self, id: SessionId) -> Result<SessionStatus, BuildError> {
        self.registry.wait(id).await
    }

    pub fn list_sessions(&self) -> Vec<SessionStatus> {
        self.registry.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_message(result: Result<BuildSpec, BuildError>) -> String {
        match result {
            Err(BuildError::Validation(msg)) => msg,
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn empty_directory_is_rejected() {
        assert_eq!(validation_message(validate_request("  ", "arm64")), "No directory selected");
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let msg = validation_message(validate_request(dir.path().to_str().unwrap(), "x86"));
        assert!(msg.contains("Invalid platform 'x86'"));
    }

    #[test]
    fn missing_directory_is_rejected() {
        let msg = validation_message(validate_request("/tmp/bskit-missing-repo-dir", "arm64"));
        assert_eq!(msg, "Directory /tmp/bskit-missing-repo-dir does not exist");
    }

    #[test]
    fn file_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Dockerfile");
        std::fs::write(&file, "FROM scratch").unwrap();
        let msg = validation_message(validate_request(file.to_str().unwrap(), "amd64"));
        assert!(msg.ends_with("is not a directory"));
    }

    #[test]
    fn spellings_share_a_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        let plain = dir.path().join("app");
        let dotted = dir.path().join("app").join("..").join("app");

        let a = validate_request(plain.to_str().unwrap(), "arm64").unwrap();
        let b = validate_request(dotted.to_str().unwrap(), " arm64 ").unwrap();
        assert_eq!(a.key(), b.key());
        assert!(a.target_directory.is_absolute());
    }
}
