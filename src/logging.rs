//! Tracing initialisation for the bskit binary.
//!
//! Human-readable (or JSON) output goes to stderr so it never mixes with
//! build output on stdout. `[logging].file` adds a second, non-blocking
//! file sink.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LoggingSection;

/// Keeps the file writer flushing. Hold it until the process exits.
#[must_use]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(settings: &LoggingSection, verbose: bool, fallback: &str) -> String {
    if verbose {
        return "debug".to_string();
    }
    settings
        .level
        .clone()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Install the global subscriber. Only the first call in a process takes
/// effect; later calls still return a guard.
pub fn init(settings: &LoggingSection, verbose: bool, fallback: &str) -> Result<LogGuard> {
    let directive = default_directive(settings, verbose, fallback);

    let stderr_layer = if settings.json {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .json()
            .with_filter(env_filter(&directive))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter(&directive))
            .boxed()
    };

    let (file_layer, file_guard) = match &settings.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(&directive))
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(LogGuard { _file: file_guard })
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(dir)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_wins_over_config() {
        let settings = LoggingSection {
            level: Some("warn".into()),
            ..Default::default()
        };
        assert_eq!(default_directive(&settings, true, "info"), "debug");
        assert_eq!(default_directive(&settings, false, "info"), "warn");
    }

    #[test]
    fn fallback_when_level_unset() {
        let settings = LoggingSection::default();
        assert_eq!(default_directive(&settings, false, "warn"), "warn");
        let blank = LoggingSection {
            level: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(default_directive(&blank, false, "info"), "info");
    }

    #[test]
    fn file_writer_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("bskit.log");
        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn file_writer_rejects_path_without_name() {
        assert!(file_writer(Path::new("/")).is_err());
    }
}
