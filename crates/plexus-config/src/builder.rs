//! Configuration builder

use crate::types::HostConfig;
use plexus_bus::BusConfig;
use plexus_remote::{RemoteConfig, Repository, UpdatePolicy};
use plexus_runtime::RuntimeConfig;
use std::path::PathBuf;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bus configuration
    pub fn bus(mut self, bus: BusConfig) -> Self {
        self.config.bus = bus;
        self
    }

    /// Set runtime configuration
    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.config.runtime = runtime;
        self
    }

    /// Set remote configuration
    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.config.remote = remote;
        self
    }

    /// Add a plugin search path
    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.runtime = self.config.runtime.with_search_path(path);
        self
    }

    /// Set the cache directory
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.remote.cache.directory = dir.into();
        self
    }

    /// Register a repository at startup
    pub fn repository(mut self, repository: Repository) -> Self {
        self.config.repositories.push(repository);
        self
    }

    /// Set the auto-update policy
    pub fn update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.config.remote.updates.policy = policy;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> plexus_core::Result<HostConfig> {
        crate::validator::validate_config(&self.config)?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = HostConfigBuilder::new()
            .search_path("/opt/plugins")
            .search_path("/opt/plugins")
            .cache_dir("/tmp/plexus-cache")
            .repository(Repository::new("main", "https://plugins.example.com").unwrap())
            .update_policy(UpdatePolicy::Patch)
            .build()
            .unwrap();

        assert_eq!(config.runtime.search_paths, vec![PathBuf::from("/opt/plugins")]);
        assert_eq!(config.remote.cache.directory, PathBuf::from("/tmp/plexus-cache"));
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.remote.updates.policy, UpdatePolicy::Patch);
    }

    #[test]
    fn test_builder_validates() {
        let result = HostConfigBuilder::new()
            .bus(BusConfig {
                max_queue_size: 0,
                ..BusConfig::default()
            })
            .build();
        assert!(result.is_err());
    }
}
