//! Configuration validation

use crate::HostConfig;
use plexus_core::{PluginError, Result};
use plexus_remote::UrlPolicy;
use std::collections::HashSet;

/// Validate configuration
pub fn validate_config(config: &HostConfig) -> Result<()> {
    config.bus.validate()?;
    config.runtime.validate()?;
    config.remote.validate()?;
    validate_recovery(config)?;
    validate_repositories(config)?;
    validate_paths(config);
    Ok(())
}

fn validate_recovery(config: &HostConfig) -> Result<()> {
    config.recovery.retry.validate()?;
    config.recovery.circuit_breaker.validate()
}

fn validate_repositories(config: &HostConfig) -> Result<()> {
    let policy = UrlPolicy::new(config.remote.url_policy.clone());
    let mut seen = HashSet::new();

    for repo in &config.repositories {
        if repo.id.trim().is_empty() {
            return Err(PluginError::invalid_configuration(
                "repository id cannot be empty",
            ));
        }
        if !seen.insert(repo.id.as_str()) {
            return Err(PluginError::invalid_configuration(format!(
                "duplicate repository id: {}",
                repo.id
            )));
        }
        policy.check(&repo.url).map_err(|e| {
            PluginError::invalid_configuration(format!(
                "repository '{}' violates the URL policy: {}",
                repo.id,
                e.message()
            ))
        })?;
        if repo.update_interval.is_zero() {
            return Err(PluginError::invalid_configuration(format!(
                "repository '{}' update_interval must be > 0",
                repo.id
            )));
        }
        if !repo.enabled {
            tracing::warn!(repository = %repo.id, "Repository is disabled");
        }
    }
    Ok(())
}

fn validate_paths(config: &HostConfig) {
    for path in &config.runtime.search_paths {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Plugin search path does not exist");
        }
    }
    if config
        .runtime
        .search_paths
        .iter()
        .any(|p| p == &config.remote.cache.directory)
    {
        tracing::warn!(
            dir = %config.remote.cache.directory.display(),
            "Cache directory is also a search path"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::ErrorKind;
    use plexus_remote::Repository;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&HostConfig::default()).is_ok());
    }

    #[test]
    fn test_duplicate_repositories_rejected() {
        let mut config = HostConfig::default();
        config.repositories = vec![
            Repository::new("main", "https://a.example.com").unwrap(),
            Repository::new("main", "https://b.example.com").unwrap(),
        ];
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.message().contains("duplicate"));
    }

    #[test]
    fn test_repository_must_pass_url_policy() {
        let mut config = HostConfig::default();
        config.repositories = vec![Repository::new("plain", "http://a.example.com").unwrap()];
        assert!(validate_config(&config).is_err());

        config.remote.url_policy.allowed_schemes.push("http".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_component_bounds_checked() {
        let mut config = HostConfig::default();
        config.bus.max_queue_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = HostConfig::default();
        config.runtime.initialize_timeout = Duration::ZERO;
        assert!(validate_config(&config).is_err());

        let mut config = HostConfig::default();
        config.recovery.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());
    }
}
