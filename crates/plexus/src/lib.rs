//! # Plexus
//!
//! Dynamic plugin host. Native plugins are discovered on disk or fetched
//! from remote repositories, loaded into one process, and coordinated
//! through a shared message bus and service contract registry.
//!
//! ## Features
//!
//! - **Unified loading**: one call resolves a plugin locally or remotely
//!   under a [`LoadStrategy`] and records where it came from
//! - **Remote install**: verified downloads into a content cache, with an
//!   installed ledger
//! - **Updates and rollback**: version switches through hot reload that
//!   leave the previous version running when they fail
//! - **Auto-update**: a periodic check governed by an [`UpdatePolicy`]
//! - **Lifecycle events**: every state change is published on the bus as a
//!   [`PluginLifecycleEvent`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let config = plexus::config::load("plexus.yaml")?;
//! let host = Arc::new(UnifiedManager::new(config)?);
//! host.start()?;
//!
//! host.subscribe_lifecycle("host.logger", |event| {
//!     println!("{} {} -> {}", event.plugin_id, event.from, event.to);
//! })?;
//!
//! let handle = host
//!     .load_plugin("com.example.alpha", UnifiedLoadOptions::default())
//!     .await?;
//! let reply = handle
//!     .execute_command("hello", serde_json::json!({ "name": "World" }))
//!     .await?;
//! println!("{reply}");
//!
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod events;
pub mod manager;
pub mod options;
pub mod updates;

pub use events::{PluginLifecycleEvent, UpdateAvailableEvent, HOST_SENDER};
pub use manager::{HostStatus, UnifiedManager, REMOTE_ACQUIRE};
pub use options::{LoadStrategy, UnifiedLoadOptions};
pub use updates::{UpdateOutcome, UpdateReport};

pub use plexus_bus as bus;
pub use plexus_config as config;
pub use plexus_contracts as contracts;
pub use plexus_plugin_api as plugin_api;
pub use plexus_recovery as recovery;
pub use plexus_remote as remote;
pub use plexus_runtime as runtime;

pub use plexus_remote::UpdatePolicy;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::events::PluginLifecycleEvent;
    pub use crate::manager::UnifiedManager;
    pub use crate::options::{LoadStrategy, UnifiedLoadOptions};
    pub use crate::updates::{UpdateOutcome, UpdateReport};
    pub use plexus_config::HostConfig;
    pub use plexus_core::{PluginError, PluginState, Result, Version};
    pub use plexus_remote::{Repository, UpdatePolicy};
    pub use plexus_runtime::{PluginHandle, PluginSource};
}
