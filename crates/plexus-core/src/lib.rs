//! # Plexus Core
//!
//! Foundational types shared by every Plexus crate:
//! - Structured error record and result alias
//! - Semantic versions with the host compatibility predicate
//! - Plugin metadata, capability sets, and the lifecycle state machine
//!
//! Nothing in this crate performs I/O.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

#[macro_use]
mod bitset;

pub mod capability;
pub mod error;
pub mod metadata;
pub mod state;
pub mod version;

pub use capability::PluginCapabilities;
pub use error::{ErrorCategory, ErrorKind, PluginError, Result, ResultExt, Severity, SourceLocation};
pub use metadata::{validate_plugin_id, PluginMetadata, PluginMetadataBuilder, PluginPriority};
pub use state::PluginState;
pub use version::{Version, VersionBump};

#[doc(hidden)]
pub mod __private {
    pub use serde;
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::capability::PluginCapabilities;
    pub use crate::error::{ErrorKind, PluginError, Result, ResultExt, Severity};
    pub use crate::metadata::{PluginMetadata, PluginPriority};
    pub use crate::state::PluginState;
    pub use crate::version::Version;
}
