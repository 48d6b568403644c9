//! Workspace configuration (depot.toml)

use crate::manifest::ToolsVersion;
use crate::semver::PrereleasePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration file name at the workspace root
pub const CONFIG_FILE_NAME: &str = "depot.toml";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Engine settings shared by every workspace operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Configuration {
    /// Tools version of this engine; newer manifests are rejected
    pub tools_version: ToolsVersion,

    /// Oldest manifest tools version still accepted
    pub minimum_tools_version: ToolsVersion,

    /// Take the pins file as ground truth and never run the resolver
    pub force_resolved_versions: bool,

    /// Do not refresh repositories that already have a local copy
    pub skip_update: bool,

    pub prerelease_policy: PrereleasePolicy,

    /// Triple used to select archives from artifact index documents
    pub host_triple: String,

    /// Worker pool size
    pub worker_threads: usize,

    /// Original location to mirror location
    pub mirrors: Mirrors,

    /// Keep repository copies in a per-user cache shared between workspaces
    pub shared_cache: bool,

    /// Overrides the per-user cache directory
    pub cache_directory: Option<PathBuf>,

    /// Process environment variables the manifest evaluator reads
    pub manifest_environment: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            tools_version: ToolsVersion::CURRENT,
            minimum_tools_version: ToolsVersion::MINIMUM,
            force_resolved_versions: false,
            skip_update: false,
            prerelease_policy: PrereleasePolicy::default(),
            host_triple: default_host_triple(),
            worker_threads: num_cpus::get().max(1),
            mirrors: Mirrors::default(),
            shared_cache: false,
            cache_directory: None,
            manifest_environment: Vec::new(),
        }
    }
}

impl Configuration {
    /// Load from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Configuration::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Directory for repository copies shared between workspaces, if enabled
    pub fn shared_cache_directory(&self) -> Option<PathBuf> {
        if !self.shared_cache {
            return None;
        }
        self.cache_directory
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("depot")))
    }
}

/// Location rewrites applied to remote dependencies before fetching
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mirrors(BTreeMap<String, String>);

impl Mirrors {
    pub fn set(&mut self, original: impl Into<String>, mirror: impl Into<String>) {
        self.0.insert(original.into(), mirror.into());
    }

    pub fn unset(&mut self, original: &str) -> Option<String> {
        self.0.remove(original)
    }

    /// The location to actually use for `location`
    pub fn effective(&self, location: &str) -> String {
        self.0
            .get(location)
            .cloned()
            .unwrap_or_else(|| location.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable text form, part of manifest cache keys
    pub fn fingerprint(&self) -> String {
        self.0
            .iter()
            .map(|(original, mirror)| format!("{}={}", original, mirror))
            .collect::<Vec<_>>()
            .join(";")
    }
}

fn default_host_triple() -> String {
    let arch = std::env::consts::ARCH;
    match std::env::consts::OS {
        "macos" => format!("{}-apple-macosx", arch),
        "linux" => format!("{}-unknown-linux-gnu", arch),
        "windows" => format!("{}-unknown-windows-msvc", arch),
        other => format!("{}-unknown-{}", arch, other),
    }
}
