//! Load strategies and options for the unified manager

use plexus_core::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the unified manager looks for a plugin, and in which order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Local search paths first, then remote repositories
    #[default]
    PreferLocal,
    /// Remote repositories first, then local search paths
    PreferRemote,
    /// Local search paths only
    LocalOnly,
    /// Remote repositories (and their cache) only
    RemoteOnly,
    /// Whichever side offers the higher version; ties go to the local copy
    BestVersion,
}

impl LoadStrategy {
    /// Whether the strategy may consult local search paths
    pub fn uses_local(self) -> bool {
        self != LoadStrategy::RemoteOnly
    }

    /// Whether the strategy may consult remote repositories
    pub fn uses_remote(self) -> bool {
        self != LoadStrategy::LocalOnly
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStrategy::PreferLocal => "prefer_local",
            LoadStrategy::PreferRemote => "prefer_remote",
            LoadStrategy::LocalOnly => "local_only",
            LoadStrategy::RemoteOnly => "remote_only",
            LoadStrategy::BestVersion => "best_version",
        };
        f.write_str(name)
    }
}

/// Options for [`UnifiedManager::load_plugin`](crate::UnifiedManager::load_plugin)
#[derive(Debug, Clone)]
pub struct UnifiedLoadOptions {
    /// Search order
    pub strategy: LoadStrategy,
    /// Exact version wanted; `None` takes the highest available
    pub version: Option<Version>,
    /// Configuration document handed to the plugin
    pub config: Option<serde_json::Value>,
    /// Initialize after loading
    pub initialize: bool,
    /// Override the runtime's hot reload default
    pub hot_reload: Option<bool>,
    /// Record a remotely acquired plugin in the installed ledger
    pub record_install: bool,
}

impl Default for UnifiedLoadOptions {
    fn default() -> Self {
        Self {
            strategy: LoadStrategy::default(),
            version: None,
            config: None,
            initialize: true,
            hot_reload: None,
            record_install: true,
        }
    }
}

impl UnifiedLoadOptions {
    /// Options with a given strategy
    pub fn with_strategy(strategy: LoadStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Ask for an exact version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the configuration document
    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Load without initializing
    pub fn load_only(mut self) -> Self {
        self.initialize = false;
        self
    }

    /// Override hot reload for this plugin
    pub fn hot_reload(mut self, enabled: bool) -> Self {
        self.hot_reload = Some(enabled);
        self
    }
}
