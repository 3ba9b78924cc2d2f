//! bskit configuration, read from `bskit.toml`.
//!
//! Layering is file → environment → CLI flags. A missing file means
//! defaults throughout.
//!
//! ```toml
//! [builder]
//! program = "pack"
//! args = ["build", "{name}", "--path", "{directory}", "--builder",
//!         "paketobuildpacks/builder-jammy-base", "--creation-time", "now",
//!         "--platform", "linux/{platform}"]
//! image_name = "test-app"
//!
//! [builder.env]
//! DOCKER_HOST = "unix:///var/run/docker.sock"
//!
//! [completion]
//! success_patterns = ["Build completed successfully!"]
//! failure_patterns = ["^ERROR: failed to build"]
//! require_success_marker = false
//!
//! [bus]
//! history_capacity = 10000
//! subscriber_capacity = 1024
//! overflow = "disconnect"   # or "drop-oldest"
//!
//! [session]
//! timeout_secs = 1800
//! exit_grace_ms = 2000
//! failure_tail_lines = 20
//! max_line_bytes = 65536
//! retain_finished = 32
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//!
//! [logging]
//! level = "info"
//! file = "/var/log/bskit/bskit.log"
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::{BusConfig, DEFAULT_HISTORY_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY, OverflowPolicy};
use crate::process::CommandTemplate;
use crate::process::command::{DEFAULT_PROGRAM, default_args};
use crate::registry::{DEFAULT_RETAIN_FINISHED, RegistrySettings};
use crate::session::completion::DEFAULT_SUCCESS_PATTERN;
use crate::session::{
    CompletionMatcher, DEFAULT_FAILURE_TAIL_LINES, DEFAULT_MAX_LINE_BYTES, SessionConfig,
};

/// Environment variable that overrides `[builder].program`.
pub const BUILD_CMD_ENV: &str = "BSKIT_BUILD_CMD";

pub const CONFIG_FILE_NAME: &str = "bskit.toml";

/// External build command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Executable to run (default: "pack")
    #[serde(default)]
    pub program: Option<String>,
    /// Arguments; `{directory}`, `{platform}` and `{name}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Image name passed as `{name}` (default: slug of the directory name)
    #[serde(default)]
    pub image_name: Option<String>,
    /// Extra environment for the build process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_args(),
            image_name: None,
            env: BTreeMap::new(),
        }
    }
}

/// Sentinel lines that end a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_success_patterns")]
    pub success_patterns: Vec<String>,
    #[serde(default)]
    pub failure_patterns: Vec<String>,
    /// Fail builds that exit 0 without printing a success sentinel
    #[serde(default)]
    pub require_success_marker: bool,
}

fn default_success_patterns() -> Vec<String> {
    vec![regex::escape(DEFAULT_SUCCESS_PATTERN)]
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            success_patterns: default_success_patterns(),
            failure_patterns: Vec::new(),
            require_success_marker: false,
        }
    }
}

/// Log fan-out limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Kill builds running longer than this (default: no limit)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
    #[serde(default = "default_failure_tail_lines")]
    pub failure_tail_lines: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

fn default_exit_grace_ms() -> u64 {
    2000
}

fn default_failure_tail_lines() -> usize {
    DEFAULT_FAILURE_TAIL_LINES
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_retain_finished() -> usize {
    DEFAULT_RETAIN_FINISHED
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            exit_grace_ms: default_exit_grace_ms(),
            failure_tail_lines: default_failure_tail_lines(),
            max_line_bytes: default_max_line_bytes(),
            retain_finished: default_retain_finished(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset (e.g. "info", "bskit=debug")
    #[serde(default)]
    pub level: Option<String>,
    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

/// Root of `bskit.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BskitToml {
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl BskitToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse bskit.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize bskit.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// `<config dir>/bskit/bskit.toml`, or `./bskit.toml` when the platform
    /// has no config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("bskit").join(CONFIG_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }

    /// Build program: `BSKIT_BUILD_CMD`, then the file, then "pack".
    pub fn builder_program(&self) -> String {
        std::env::var(BUILD_CMD_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.builder.program.clone())
            .unwrap_or_else(|| DEFAULT_PROGRAM.to_string())
    }

    pub fn command_template(&self) -> CommandTemplate {
        CommandTemplate {
            program: self.builder_program(),
            args: self.builder.args.clone(),
            image_name: self.builder.image_name.clone(),
            env: self.builder.env.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self
                .session
                .timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            exit_grace: Duration::from_millis(self.session.exit_grace_ms),
            failure_tail_lines: self.session.failure_tail_lines,
            max_line_bytes: self.session.max_line_bytes,
            require_success_marker: self.completion.require_success_marker,
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            history_capacity: self.bus.history_capacity,
            subscriber_capacity: self.bus.subscriber_capacity,
            overflow: self.bus.overflow,
        }
    }

    /// Compile everything the registry needs. Fails on invalid patterns.
    pub fn registry_settings(&self) -> Result<RegistrySettings> {
        let matcher = CompletionMatcher::from_patterns(
            &self.completion.success_patterns,
            &self.completion.failure_patterns,
        )
        .context("Invalid pattern in [completion]")?;

        Ok(RegistrySettings {
            template: self.command_template(),
            matcher,
            session: self.session_config(),
            bus: self.bus_config(),
            retain_finished: self.session.retain_finished,
        })
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (section, patterns) in [
            ("success_patterns", &self.completion.success_patterns),
            ("failure_patterns", &self.completion.failure_patterns),
        ] {
            for pattern in patterns {
                if let Err(e) = regex::Regex::new(pattern) {
                    warnings.push(format!("Invalid regex '{}' in completion.{}: {}", pattern, section, e));
                }
            }
        }

        if !self.command_template().mentions_directory() {
            warnings.push(
                "builder.args does not mention {directory}; the build runs in the target directory only"
                    .to_string(),
            );
        }
        if self.builder_program().trim().is_empty() {
            warnings.push("builder.program is empty".to_string());
        }
        if self.bus.subscriber_capacity == 0 {
            warnings.push("bus.subscriber_capacity is 0; using 1".to_string());
        }
        if self.bus.history_capacity == 0 {
            warnings.push("bus.history_capacity is 0; late subscribers will miss all output".to_string());
        }
        if self.session.max_line_bytes == 0 {
            warnings.push("session.max_line_bytes is 0; using 1".to_string());
        }
        if self.session.timeout_secs == Some(0) {
            warnings.push("session.timeout_secs is 0; builds will not time out".to_string());
        }
        if self.server.host.trim().is_empty() {
            warnings.push("server.host is empty".to_string());
        }

        warnings
    }
}
