//! # Plexus Plugin API
//!
//! The SDK for writing Plexus plugins.
//!
//! A plugin implements [`Plugin`], receives a [`PluginContext`] on
//! initialization, and reaches the bus and the contract registry only
//! through it. Native plugins export themselves with [`declare_plugin!`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_plugin_api::prelude::*;
//!
//! #[derive(Debug)]
//! struct Greeter {
//!     metadata: PluginMetadata,
//! }
//!
//! #[async_trait]
//! impl Plugin for Greeter {
//!     fn metadata(&self) -> &PluginMetadata {
//!         &self.metadata
//!     }
//!
//!     async fn initialize(&mut self, _ctx: PluginContext) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn shutdown(&mut self) {}
//!
//!     async fn execute_command(&mut self, command: &str, params: serde_json::Value) -> Result<serde_json::Value> {
//!         match command {
//!             "greet" => Ok(serde_json::json!({ "hello": params["name"] })),
//!             other => Err(PluginError::command_not_found(other)),
//!         }
//!     }
//!
//!     fn available_commands(&self) -> Vec<String> {
//!         vec!["greet".to_string()]
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod abi;
pub mod context;
pub mod plugin;

#[cfg(feature = "testing")]
pub mod testing;

use std::sync::Arc;

pub use abi::{
    PluginCreateFn, PluginMetadataFn, PLUGIN_ABI_VERSION, PLUGIN_CREATE_SYMBOL,
    PLUGIN_METADATA_SYMBOL,
};
pub use context::{PluginContext, PluginDirectory, StagedRegistrations};
pub use plugin::{HealthStatus, Plugin, TransactionId};

/// Factory producing fresh plugin instances, used for statically linked plugins
pub type PluginFactory = Arc<dyn Fn() -> plexus_core::Result<Box<dyn Plugin>> + Send + Sync>;

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;
}

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::context::PluginContext;
    pub use crate::plugin::{HealthStatus, Plugin};
    pub use async_trait::async_trait;
    pub use plexus_bus::{DeliveryMode, Event, Message};
    pub use plexus_contracts::{ServiceContract, ServiceMethod, ServiceParameter, ServiceRequirement};
    pub use plexus_core::prelude::*;
}
