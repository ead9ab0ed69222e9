//! Remote pipeline configuration

use crate::signature::TrustLevel;
use crate::update::UpdatePolicy;
use plexus_core::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Remote acquisition configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Content cache
    pub cache: CacheConfig,
    /// Download manager and HTTP client
    pub download: DownloadConfig,
    /// URL admission
    pub url_policy: UrlPolicyConfig,
    /// Signature verification
    pub security: SecurityConfig,
    /// Automatic updates
    pub updates: UpdateConfig,
    /// Serve a valid cached copy when every repository fails
    pub fallback_to_cache: bool,
}

impl RemoteConfig {
    /// Config rooted at `cache_dir`
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.directory = dir.into();
        self
    }

    /// Validate bounded values
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.download.validate()?;
        self.url_policy.validate()?;
        self.security.validate()?;
        self.updates.validate()
    }
}

/// Content cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the persisted state (index, artifacts, trust store, ledgers)
    pub directory: PathBuf,
    /// Byte ceiling for cached artifacts
    pub max_size_bytes: u64,
    /// Age after which an entry expires
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Period of the expiry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("plexus-cache"),
            max_size_bytes: 1024 * 1024 * 1024,
            default_ttl: Duration::from_secs(30 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.max_size_bytes == 0 {
            return Err(PluginError::invalid_configuration(
                "remote.cache.max_size_bytes must be greater than zero",
            ));
        }
        if self.cleanup_interval < Duration::from_secs(1) {
            return Err(PluginError::invalid_configuration(
                "remote.cache.cleanup_interval must be at least 1s",
            ));
        }
        Ok(())
    }
}

/// Download manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Concurrent transfers
    pub max_concurrent: usize,
    /// Largest artifact accepted
    pub max_file_size: u64,
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Whole-request timeout for metadata calls and per-chunk read timeout
    /// for transfers
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base retry delay; doubles per retry, with jitter
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_file_size: 256 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            user_agent: format!("plexus/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DownloadConfig {
    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 || self.max_concurrent > 64 {
            return Err(PluginError::invalid_configuration(
                "remote.download.max_concurrent must be within 1..=64",
            ));
        }
        if self.max_file_size == 0 {
            return Err(PluginError::invalid_configuration(
                "remote.download.max_file_size must be greater than zero",
            ));
        }
        if self.max_retries > 20 {
            return Err(PluginError::invalid_configuration(
                "remote.download.max_retries must not exceed 20",
            ));
        }
        if self.read_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(PluginError::invalid_configuration(
                "remote.download timeouts must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// URL admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlPolicyConfig {
    /// Permitted schemes
    pub allowed_schemes: Vec<String>,
    /// When non-empty, only these hosts are permitted
    pub allowed_hosts: Vec<String>,
    /// Hosts that are always refused
    pub denied_hosts: Vec<String>,
    /// Redirect depth limit
    pub max_redirects: usize,
}

impl Default for UrlPolicyConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["https".to_string()],
            allowed_hosts: Vec::new(),
            denied_hosts: Vec::new(),
            max_redirects: 5,
        }
    }
}

impl UrlPolicyConfig {
    fn validate(&self) -> Result<()> {
        if self.allowed_schemes.is_empty() {
            return Err(PluginError::invalid_configuration(
                "remote.url_policy.allowed_schemes must not be empty",
            ));
        }
        Ok(())
    }
}

/// Signature verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require a valid signature for every artifact
    pub require_signatures: bool,
    /// Lowest publisher trust level accepted
    pub minimum_trust_level: TrustLevel,
    /// Oldest signature accepted
    #[serde(with = "humantime_serde")]
    pub signature_max_age: Duration,
    /// How long loaded certificates are reused before rereading the trust store
    #[serde(with = "humantime_serde")]
    pub certificate_cache_time: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_signatures: false,
            minimum_trust_level: TrustLevel::Community,
            signature_max_age: Duration::from_secs(365 * 24 * 3600),
            certificate_cache_time: Duration::from_secs(3600),
        }
    }
}

impl SecurityConfig {
    fn validate(&self) -> Result<()> {
        if self.signature_max_age.is_zero() {
            return Err(PluginError::invalid_configuration(
                "remote.security.signature_max_age must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Automatic update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// What the host may do on its own
    pub policy: UpdatePolicy,
    /// Period of the update check
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            policy: UpdatePolicy::CheckOnly,
            check_interval: Duration::from_secs(6 * 3600),
        }
    }
}

impl UpdateConfig {
    fn validate(&self) -> Result<()> {
        if self.check_interval < Duration::from_secs(1) {
            return Err(PluginError::invalid_configuration(
                "remote.updates.check_interval must be at least 1s",
            ));
        }
        Ok(())
    }
}
