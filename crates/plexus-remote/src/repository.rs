//! Repositories and the catalog entries they publish

use crate::fs::{read_json, write_json};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plexus_core::{PluginError, PluginMetadata, Result, Version};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// File name of the persisted repository list
pub const REPOSITORIES_FILE: &str = "repositories.json";

/// A named remote source of plugins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// Unique repository id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Base URL for the repository protocol
    pub url: Url,
    /// Disabled repositories are skipped during resolution
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower values are consulted first
    #[serde(default)]
    pub priority: i32,
    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Require signatures for everything from this repository
    #[serde(default)]
    pub require_signatures: bool,
    /// Catalog refresh period
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,
    /// Last successful catalog refresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<DateTime<Utc>>,
    /// Last refresh failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_update_interval() -> Duration {
    Duration::from_secs(3600)
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl Repository {
    /// Create an enabled repository
    pub fn new(id: impl Into<String>, url: &str) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PluginError::invalid_argument("Repository id must not be empty"));
        }
        let url = Url::parse(url)
            .map_err(|e| PluginError::invalid_argument(format!("Invalid repository URL '{url}': {e}")))?;
        let url = with_trailing_slash(url);
        Ok(Self {
            name: id.clone(),
            id,
            url,
            enabled: true,
            priority: 0,
            auth_token: None,
            require_signatures: false,
            update_interval: default_update_interval(),
            last_refreshed: None,
            last_error: None,
        })
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Require signatures
    pub fn with_required_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    /// Resolve a protocol path against the base URL
    ///
    /// The base is treated as a directory even when it was configured
    /// without a trailing slash.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        with_trailing_slash(self.url.clone())
            .join(path.trim_start_matches('/'))
            .map_err(|e| PluginError::invalid_argument(format!("Invalid endpoint '{path}': {e}")))
    }

    /// Whether the catalog is due for a refresh
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_refreshed {
            None => true,
            Some(at) => (now - at).to_std().map_or(true, |age| age >= self.update_interval),
        }
    }
}

/// A catalog entry: plugin metadata plus what is needed to fetch the artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePluginMetadata {
    /// Plugin metadata
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    /// Artifact file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Lowercase hex SHA-256 of the artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Artifact size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Publisher id for signature verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
    /// Whether a detached signature is published and must verify
    #[serde(default)]
    pub signed: bool,
    /// Absolute download URL overriding the protocol path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<Url>,
    /// Publication time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl RemotePluginMetadata {
    /// Entry for `metadata` with no download details
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            filename: None,
            checksum: None,
            size: None,
            publisher_id: None,
            signed: false,
            download_url: None,
            published_at: None,
        }
    }

    /// Plugin id
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Plugin version
    pub fn version(&self) -> &Version {
        &self.metadata.version
    }

    /// Artifact file name, defaulting to the id with the platform extension
    pub fn artifact_filename(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            format!(
                "{}.{}",
                self.metadata.id.replace('.', "_"),
                std::env::consts::DLL_EXTENSION
            )
        })
    }
}

/// Choose the entry for `plugin_id`: the exact `version` when given,
/// otherwise the highest
pub fn select_version<'a>(
    entries: impl IntoIterator<Item = &'a RemotePluginMetadata>,
    plugin_id: &str,
    version: Option<&Version>,
) -> Option<&'a RemotePluginMetadata> {
    let candidates = entries.into_iter().filter(|e| e.id() == plugin_id);
    match version {
        Some(v) => candidates.into_iter().find(|e| e.version() == v),
        None => candidates.max_by(|a, b| a.version().cmp(b.version())),
    }
}

/// Configured repositories, persisted to `repositories.json`
#[derive(Debug)]
pub struct RepositoryRegistry {
    path: PathBuf,
    repositories: RwLock<Vec<Repository>>,
}

impl RepositoryRegistry {
    /// Open the registry stored under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(REPOSITORIES_FILE);
        let repositories: Vec<Repository> = read_json(&path)?.unwrap_or_default();
        info!(count = repositories.len(), "Loaded repository list");
        Ok(Self {
            path,
            repositories: RwLock::new(repositories),
        })
    }

    fn save(&self, repositories: &[Repository]) -> Result<()> {
        write_json(&self.path, &repositories)
    }

    /// Add a repository; ids are unique
    pub fn add(&self, repository: Repository) -> Result<()> {
        let mut repos = self.repositories.write();
        if repos.iter().any(|r| r.id == repository.id) {
            return Err(PluginError::already_exists(format!(
                "Repository '{}'",
                repository.id
            )));
        }
        info!(repository = %repository.id, url = %repository.url, "Repository added");
        repos.push(repository);
        self.save(&repos)
    }

    /// Remove a repository
    pub fn remove(&self, id: &str) -> Result<Repository> {
        let mut repos = self.repositories.write();
        let index = repos
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| PluginError::not_found(format!("Repository '{id}'")))?;
        let removed = repos.remove(index);
        self.save(&repos)?;
        info!(repository = %id, "Repository removed");
        Ok(removed)
    }

    /// Enable or disable a repository
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.update(id, |r| r.enabled = enabled)
    }

    /// Record the outcome of a catalog refresh
    pub fn record_refresh(&self, id: &str, outcome: std::result::Result<(), String>) -> Result<()> {
        self.update(id, |r| match outcome {
            Ok(()) => {
                r.last_refreshed = Some(Utc::now());
                r.last_error = None;
            }
            Err(e) => {
                warn!(repository = %r.id, error = %e, "Catalog refresh failed");
                r.last_error = Some(e);
            }
        })
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Repository)) -> Result<()> {
        let mut repos = self.repositories.write();
        let repo = repos
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| PluginError::not_found(format!("Repository '{id}'")))?;
        f(repo);
        self.save(&repos)
    }

    /// A repository by id
    pub fn get(&self, id: &str) -> Option<Repository> {
        self.repositories.read().iter().find(|r| r.id == id).cloned()
    }

    /// Every repository
    pub fn all(&self) -> Vec<Repository> {
        self.repositories.read().clone()
    }

    /// Enabled repositories in priority order; ties keep insertion order
    pub fn enabled(&self) -> Vec<Repository> {
        let mut repos: Vec<_> = self
            .repositories
            .read()
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        repos.sort_by_key(|r| r.priority);
        repos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, version: Version) -> RemotePluginMetadata {
        RemotePluginMetadata::new(
            PluginMetadata::builder(id)
                .version(version)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_endpoint_joins_base_path() {
        let repo = Repository::new("main", "https://plugins.example.com/api").unwrap();
        assert_eq!(
            repo.endpoint("plugin/com.example.a/1.0.0/download").unwrap().as_str(),
            "https://plugins.example.com/api/plugin/com.example.a/1.0.0/download"
        );
    }

    #[test]
    fn test_select_version() {
        let entries = vec![
            entry("com.example.a", Version::new(1, 0, 0)),
            entry("com.example.a", Version::new(1, 2, 0)),
            entry("com.example.b", Version::new(3, 0, 0)),
        ];
        assert_eq!(
            select_version(&entries, "com.example.a", None).unwrap().version(),
            &Version::new(1, 2, 0)
        );
        assert_eq!(
            select_version(&entries, "com.example.a", Some(&Version::new(1, 0, 0)))
                .unwrap()
                .version(),
            &Version::new(1, 0, 0)
        );
        assert!(select_version(&entries, "com.example.a", Some(&Version::new(2, 0, 0))).is_none());
    }

    #[test]
    fn test_catalog_entry_document() {
        let doc = serde_json::json!({
            "id": "com.example.remote",
            "name": "Remote",
            "version": "1.0.0",
            "checksum": "ab",
            "publisher_id": "example",
            "signed": true
        });
        let entry: RemotePluginMetadata = serde_json::from_value(doc).unwrap();
        assert_eq!(entry.id(), "com.example.remote");
        assert!(entry.signed);
        assert_eq!(entry.publisher_id.as_deref(), Some("example"));
    }

    #[test]
    fn test_registry_persists_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RepositoryRegistry::open(dir.path()).unwrap();
        registry
            .add(Repository::new("b", "https://b.example.com").unwrap().with_priority(10))
            .unwrap();
        registry
            .add(Repository::new("a", "https://a.example.com").unwrap().with_priority(1))
            .unwrap();
        assert!(registry.add(Repository::new("a", "https://x.example.com").unwrap()).is_err());
        registry.set_enabled("b", false).unwrap();

        let reopened = RepositoryRegistry::open(dir.path()).unwrap();
        let ids: Vec<_> = reopened.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        let enabled: Vec<_> = reopened.enabled().into_iter().map(|r| r.id).collect();
        assert_eq!(enabled, vec!["a"]);

        reopened.record_refresh("a", Err("timeout".to_string())).unwrap();
        assert_eq!(reopened.get("a").unwrap().last_error.as_deref(), Some("timeout"));
        assert!(reopened.get("a").unwrap().is_stale(Utc::now()));
    }
}
