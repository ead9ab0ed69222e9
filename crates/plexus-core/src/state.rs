//! Plugin lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a plugin record
///
/// ```text
/// Unloaded -> Loading -> Loaded -> Initializing -> Running <-> Paused
///                                                    |           |
///                                                    +-> Stopping -> Stopped -> Unloaded
/// ```
///
/// `Error` is entered by a failed initialisation or a forced error and keeps
/// the record for inspection. `Reloading` is transient while a hot reload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// No artifact bound
    Unloaded,
    /// Artifact is being resolved and opened
    Loading,
    /// Instance exists but has not been initialised
    Loaded,
    /// initialize() is running
    Initializing,
    /// Plugin is running
    Running,
    /// Plugin is paused
    Paused,
    /// Shutdown sequence is running
    Stopping,
    /// Plugin is stopped; the artifact is still bound
    Stopped,
    /// Plugin failed; held for inspection
    Error,
    /// Artifact replacement is in progress
    Reloading,
}

impl PluginState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;

        if next == Error {
            return true;
        }

        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, Unloaded)
                | (Loaded, Initializing)
                | (Loaded, Unloaded)
                | (Loaded, Reloading)
                | (Initializing, Running)
                | (Running, Paused)
                | (Running, Stopping)
                | (Running, Reloading)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Paused, Reloading)
                | (Stopping, Stopped)
                | (Stopped, Unloaded)
                | (Stopped, Initializing)
                | (Stopped, Reloading)
                | (Error, Unloaded)
                | (Error, Stopping)
                | (Error, Reloading)
                | (Reloading, Running)
                | (Reloading, Paused)
                | (Reloading, Loaded)
                | (Reloading, Stopped)
        )
    }

    /// Running or paused
    pub fn is_active(self) -> bool {
        matches!(self, PluginState::Running | PluginState::Paused)
    }

    /// Loading, initializing, stopping, or reloading
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            PluginState::Loading
                | PluginState::Initializing
                | PluginState::Stopping
                | PluginState::Reloading
        )
    }

    /// Whether dependents may rely on this plugin (loaded or running)
    pub fn satisfies_dependency(self) -> bool {
        matches!(
            self,
            PluginState::Loaded | PluginState::Initializing | PluginState::Running | PluginState::Paused
        )
    }

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Initializing => "initializing",
            PluginState::Running => "running",
            PluginState::Paused => "paused",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Error => "error",
            PluginState::Reloading => "reloading",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
