//! # Plexus Configuration
//!
//! Configuration management for the Plexus host with support for:
//! - Multiple formats (YAML, TOML, JSON), chosen by file extension
//! - `${VAR}` / `${VAR:-default}` expansion
//! - `PLEXUS_SECTION__FIELD` environment overrides
//! - Layered files merged in order
//! - Validation of every bounded value
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_config::load_and_merge;
//!
//! # fn example() -> plexus_core::Result<()> {
//! let config = load_and_merge(vec!["config/base.yaml", "config/production.yaml"])?;
//! println!("cache at {}", config.remote.cache.directory.display());
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

pub mod builder;
pub mod loader;
pub mod merger;
pub mod types;
pub mod validator;

pub use builder::HostConfigBuilder;
pub use loader::{
    apply_env_overrides, expand_env_vars, load_and_merge, load_config, load_from_file,
    load_from_str, ENV_PREFIX,
};
pub use merger::merge_values;
pub use types::{HostConfig, RecoveryConfig};
pub use validator::validate_config;

use plexus_core::{PluginError, Result};
use std::path::Path;

/// Load configuration from a file
pub fn load<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    load_from_file(path)
}

/// Load configuration from a string
pub fn load_str(content: &str, format: ConfigFormat) -> Result<HostConfig> {
    load_from_str(content, format)
}

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PluginError::invalid_configuration("Unable to detect config format"))?;

        match ext.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(PluginError::invalid_configuration(format!(
                "Unsupported config format: {ext}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_detect_format_from_path() {
        assert_eq!(
            ConfigFormat::from_path(&PathBuf::from("host.yaml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(&PathBuf::from("host.YML")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(&PathBuf::from("host.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert_eq!(
            ConfigFormat::from_path(&PathBuf::from("host.json")).unwrap(),
            ConfigFormat::Json
        );
    }

    #[test]
    fn test_unsupported_format() {
        assert!(ConfigFormat::from_path(&PathBuf::from("host.ini")).is_err());
        assert!(ConfigFormat::from_path(&PathBuf::from("host")).is_err());
    }
}
