use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Target CPU architecture for a container build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Arm64,
    Amd64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid platform '{0}'. Valid values: arm64, amd64")]
pub struct ParsePlatformError(pub String);

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Arm64 => "arm64",
            Platform::Amd64 => "amd64",
        }
    }

    /// Container platform string as understood by `pack` and `docker`.
    pub fn container_platform(&self) -> String {
        format!("linux/{}", self.as_str())
    }

    /// Platform matching the machine bskit is running on.
    pub fn host() -> Self {
        Self::for_arch(std::env::consts::ARCH)
    }

    /// Build platform for a Rust `target_arch` name. Only 64-bit ARM builds
    /// arm64 images; everything else, 32-bit `arm` included, gets amd64.
    pub fn for_arch(arch: &str) -> Self {
        match arch {
            "aarch64" => Platform::Arm64,
            _ => Platform::Amd64,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "arm64" => Ok(Platform::Arm64),
            "amd64" => Ok(Platform::Amd64),
            other => Err(ParsePlatformError(other.to_string())),
        }
    }
}

/// A validated build request. The directory is expected to be canonical;
/// callers construct this through `bskit::service::validate_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    pub target_directory: PathBuf,
    pub platform: Platform,
}

impl BuildSpec {
    pub fn new(target_directory: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            target_directory: target_directory.into(),
            platform,
        }
    }

    pub fn key(&self) -> BuildKey {
        BuildKey {
            target_directory: self.target_directory.clone(),
            platform: self.platform,
        }
    }
}

/// Identity of a build target. At most one session per key may be active.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    target_directory: PathBuf,
    platform: Platform,
}

impl BuildKey {
    pub fn target_directory(&self) -> &Path {
        &self.target_directory
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.target_directory.display(), self.platform)
    }
}
