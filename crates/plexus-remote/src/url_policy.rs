//! URL admission for repository and download requests

use crate::config::UrlPolicyConfig;
use plexus_core::{PluginError, Result};
use url::Url;

/// Decides which URLs the pipeline may contact
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    config: UrlPolicyConfig,
}

impl UrlPolicy {
    /// Policy from configuration
    pub fn new(config: UrlPolicyConfig) -> Self {
        Self { config }
    }

    /// Redirect depth limit
    pub fn max_redirects(&self) -> usize {
        self.config.max_redirects
    }

    /// Check a URL against the scheme set and host lists
    pub fn check(&self, url: &Url) -> Result<()> {
        let scheme = url.scheme();
        if !self
            .config
            .allowed_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(scheme))
        {
            return Err(PluginError::security(format!(
                "URL scheme '{scheme}' is not allowed: {url}"
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| PluginError::security(format!("URL has no host: {url}")))?;

        if self
            .config
            .denied_hosts
            .iter()
            .any(|h| host_matches(host, h))
        {
            return Err(PluginError::security(format!("Host '{host}' is denied")));
        }

        if !self.config.allowed_hosts.is_empty()
            && !self
                .config
                .allowed_hosts
                .iter()
                .any(|h| host_matches(host, h))
        {
            return Err(PluginError::security(format!(
                "Host '{host}' is not in the allowlist"
            )));
        }
        Ok(())
    }

    /// Redirect policy enforcing the same rules on every hop
    pub fn redirect_policy(&self) -> reqwest::redirect::Policy {
        let policy = self.clone();
        reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= policy.config.max_redirects {
                return attempt.error(format!(
                    "too many redirects (limit {})",
                    policy.config.max_redirects
                ));
            }
            match policy.check(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e.message().to_string()),
            }
        })
    }
}

/// `pattern` matches the host itself or, with a leading `*.`, any subdomain
fn host_matches(host: &str, pattern: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.ends_with(&format!(".{suffix}")),
        None => host == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::ErrorKind;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_scheme_must_be_allowed() {
        let policy = UrlPolicy::new(UrlPolicyConfig::default());
        assert!(policy.check(&url("https://plugins.example.com/catalog")).is_ok());
        let err = policy.check(&url("http://plugins.example.com/catalog")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(policy.check(&url("file:///etc/passwd")).is_err());
    }

    #[test]
    fn test_host_lists() {
        let policy = UrlPolicy::new(UrlPolicyConfig {
            allowed_hosts: vec!["*.example.com".to_string(), "mirror.org".to_string()],
            denied_hosts: vec!["bad.example.com".to_string()],
            ..UrlPolicyConfig::default()
        });
        assert!(policy.check(&url("https://cdn.example.com/a")).is_ok());
        assert!(policy.check(&url("https://mirror.org/a")).is_ok());
        assert!(policy.check(&url("https://bad.example.com/a")).is_err());
        assert!(policy.check(&url("https://other.net/a")).is_err());
        assert!(policy.check(&url("https://example.com/a")).is_err());
    }
}
