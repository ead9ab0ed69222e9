//! Runtime configuration

use plexus_core::{PluginError, Result, Version};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Version of the host this runtime reports to plugins
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_host_version() -> Version {
    Version::parse(HOST_VERSION).unwrap_or(Version::new(0, 1, 0))
}

/// Local plugin runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directories scanned for plugin artifacts, in order
    pub search_paths: Vec<PathBuf>,

    /// Where native artifacts are copied before opening; defaults to a
    /// `plexus-staging` directory under the system temp dir
    pub staging_dir: Option<PathBuf>,

    /// Host version checked against plugin min/max constraints
    pub host_version: Version,

    /// Refuse artifacts when no verifier is installed
    pub require_verification: bool,

    /// Upper bound for a plugin's initialize()
    #[serde(with = "humantime_serde")]
    pub initialize_timeout: Duration,

    /// Upper bound for a plugin's prepare_shutdown() and shutdown()
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Hot reload settings
    pub hot_reload: HotReloadConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            staging_dir: None,
            host_version: default_host_version(),
            require_verification: false,
            initialize_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            hot_reload: HotReloadConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Add a search path
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !self.search_paths.contains(&path) {
            self.search_paths.push(path);
        }
        self
    }

    /// Staging directory in effect
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("plexus-staging"))
    }

    /// Validate bounded values
    pub fn validate(&self) -> Result<()> {
        if self.initialize_timeout.is_zero() {
            return Err(PluginError::invalid_configuration(
                "runtime.initialize_timeout must be greater than zero",
            ));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(PluginError::invalid_configuration(
                "runtime.shutdown_timeout must be greater than zero",
            ));
        }
        self.hot_reload.validate()
    }
}

/// Hot reload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Enable hot reload for plugins that advertise it, as they load
    pub enabled: bool,

    /// Watch artifact directories and reload on change
    pub watch: bool,

    /// Quiet period before a changed file triggers a reload
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch: false,
            debounce: Duration::from_secs(1),
        }
    }
}

impl HotReloadConfig {
    fn validate(&self) -> Result<()> {
        if self.debounce > Duration::from_secs(300) {
            return Err(PluginError::invalid_configuration(
                "runtime.hot_reload.debounce must not exceed 5m",
            ));
        }
        Ok(())
    }
}
