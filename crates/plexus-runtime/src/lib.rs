//! # Plexus Runtime
//!
//! Local plugin runtime for the Plexus host.
//!
//! ## Features
//!
//! - **Loader**: validates artifacts and their metadata documents, opens
//!   native libraries from private staging copies, or instantiates registered
//!   static factories
//! - **Dependency Resolver**: deterministic topological startup order with
//!   cycle detection
//! - **Registry**: the lifecycle state machine, per-plugin transition locks
//!   and lifecycle observers
//! - **Hot Reload**: staged, atomic replacement of a running plugin with
//!   rollback, plus an artifact directory watcher
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_runtime::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let config = RuntimeConfig::default().with_search_path("./plugins");
//! let manager = PluginManager::standalone(config)?;
//!
//! let report = manager.load_all().await?;
//! for id in &report.loaded {
//!     let reply = manager
//!         .execute_command(id, "hello", serde_json::json!({ "name": "World" }))
//!         .await?;
//!     println!("{id}: {reply}");
//! }
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod config;
pub mod hot_reload;
pub mod instance;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod watcher;

pub use config::{HotReloadConfig, RuntimeConfig, HOST_VERSION};
pub use hot_reload::{ReloadOptions, ReloadOutcome};
pub use instance::PluginInstance;
pub use loader::{ArtifactVerifier, DiscoveredPlugin, PluginLoader};
pub use manager::{LoadOptions, LoadReport, PluginManager};
pub use metrics::{RuntimeMetrics, RuntimeMetricsSnapshot};
pub use registry::{
    LifecycleEvent, LifecycleObserver, ObserverId, PluginHandle, PluginInfo, PluginRecord,
    PluginRegistry, PluginSource, RegistrySnapshot,
};
pub use resolver::DependencyResolver;
pub use watcher::{ArtifactWatcher, WatchTarget};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::hot_reload::ReloadOptions;
    pub use crate::manager::{LoadOptions, PluginManager};
    pub use crate::registry::{LifecycleEvent, PluginHandle, PluginRegistry, PluginSource};
    pub use plexus_plugin_api::prelude::*;
}
