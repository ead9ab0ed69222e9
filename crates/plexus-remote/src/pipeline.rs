//! Remote acquisition pipeline
//!
//! Turns `(plugin id, optional version)` into a verified artifact path:
//!
//! 1. a verified cache entry for the requested version wins outright;
//! 2. otherwise the enabled repositories are consulted in priority order and
//!    the first one publishing a matching version is used;
//! 3. the artifact is downloaded, its checksum compared with the catalog and,
//!    when required, its detached signature verified;
//! 4. the verified file is moved into the cache and indexed.
//!
//! When every repository fails and `fallback_to_cache` is set, a valid
//! cached copy is served instead.

use crate::cache::{CachedArtifact, PluginCache};
use crate::client::RepositoryClient;
use crate::config::RemoteConfig;
use crate::download::{DownloadManager, DownloadRequest, DownloadStatus};
use crate::installed::{InstalledPlugin, InstalledRegistry};
use crate::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
use crate::repository::{select_version, RemotePluginMetadata, Repository, RepositoryRegistry};
use crate::signature::{SignatureVerifier, TrustStore, ValidationRecord};
use crate::update::UpdateCandidate;
use crate::url_policy::UrlPolicy;
use chrono::Utc;
use parking_lot::RwLock;
use plexus_core::{ErrorKind, PluginError, Result, Version};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Directory of the trust store under the cache root
pub const TRUST_DIR: &str = "trust";

/// A verified artifact ready for the runtime loader
#[derive(Debug, Clone)]
pub struct AcquiredArtifact {
    /// Plugin id
    pub plugin_id: String,
    /// Artifact path inside the cache
    pub path: PathBuf,
    /// Version acquired
    pub version: Version,
    /// Repository the artifact came from
    pub repository: String,
    /// Served from the cache without a download
    pub from_cache: bool,
    /// Signature outcome of a fresh download
    pub validation: Option<ValidationRecord>,
}

impl AcquiredArtifact {
    fn from_cache(hit: CachedArtifact) -> Self {
        Self {
            plugin_id: hit.entry.plugin_id.clone(),
            path: hit.path,
            version: hit.entry.version,
            repository: hit.entry.repository.clone().unwrap_or_default(),
            from_cache: true,
            validation: None,
        }
    }
}

/// Outcome of a catalog refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogRefreshReport {
    /// Repositories refreshed
    pub refreshed: Vec<String>,
    /// Failed repositories and why
    pub failed: BTreeMap<String, String>,
    /// Catalog entries now known
    pub entries: usize,
}

/// A search result
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Repository answering
    pub repository: String,
    /// Matching entry
    pub entry: RemotePluginMetadata,
}

/// Remote repositories, downloads, verification and cache behind one API
#[derive(Debug)]
pub struct RemotePipeline {
    config: RemoteConfig,
    repositories: RepositoryRegistry,
    client: RepositoryClient,
    downloads: DownloadManager,
    cache: Arc<PluginCache>,
    verifier: SignatureVerifier,
    installed: InstalledRegistry,
    catalogs: RwLock<HashMap<String, Vec<RemotePluginMetadata>>>,
    metrics: Arc<PipelineMetrics>,
}

impl RemotePipeline {
    /// Open the pipeline and its persisted state under the cache directory
    pub fn open(config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let root = config.cache.directory.clone();
        let metrics = Arc::new(PipelineMetrics::default());

        let cache = Arc::new(PluginCache::open(config.cache.clone(), Arc::clone(&metrics))?);
        let client = RepositoryClient::new(&config.download, UrlPolicy::new(config.url_policy.clone()))?;
        let downloads = DownloadManager::new(
            client.clone(),
            config.download.clone(),
            cache.staging_dir(),
            Arc::clone(&metrics),
        );
        let store = Arc::new(TrustStore::open(
            root.join(TRUST_DIR),
            config.security.certificate_cache_time,
        )?);
        let verifier = SignatureVerifier::new(store, config.security.clone());
        let repositories = RepositoryRegistry::open(&root)?;
        let installed = InstalledRegistry::open(&root)?;

        info!(
            dir = %root.display(),
            repositories = repositories.all().len(),
            "Remote pipeline ready"
        );
        Ok(Self {
            config,
            repositories,
            client,
            downloads,
            cache,
            verifier,
            installed,
            catalogs: RwLock::new(HashMap::new()),
            metrics,
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Configured repositories
    pub fn repositories(&self) -> &RepositoryRegistry {
        &self.repositories
    }

    /// Content cache
    pub fn cache(&self) -> &Arc<PluginCache> {
        &self.cache
    }

    /// Trusted publisher certificates
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        self.verifier.trust_store()
    }

    /// Install ledger
    pub fn installed(&self) -> &InstalledRegistry {
        &self.installed
    }

    /// In-flight downloads
    pub fn active_downloads(&self) -> Vec<DownloadStatus> {
        self.downloads.active()
    }

    /// Counter values
    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Add a repository
    pub fn add_repository(&self, repository: Repository) -> Result<()> {
        self.client.policy().check(&repository.url)?;
        self.repositories.add(repository)
    }

    /// Remove a repository and forget its catalog
    pub fn remove_repository(&self, id: &str) -> Result<Repository> {
        let removed = self.repositories.remove(id)?;
        self.catalogs.write().remove(id);
        Ok(removed)
    }

    /// Refresh every enabled repository's catalog
    pub async fn refresh_catalogs(&self) -> CatalogRefreshReport {
        self.refresh(self.repositories.enabled()).await
    }

    /// Refresh only repositories whose update interval has elapsed
    pub async fn refresh_due(&self) -> CatalogRefreshReport {
        let now = Utc::now();
        let due = self
            .repositories
            .enabled()
            .into_iter()
            .filter(|r| r.is_stale(now))
            .collect();
        self.refresh(due).await
    }

    async fn refresh(&self, repositories: Vec<Repository>) -> CatalogRefreshReport {
        let mut report = CatalogRefreshReport::default();
        for repo in repositories {
            let outcome = self.fetch_catalog(&repo).await;
            let recorded = match &outcome {
                Ok(_) => Ok(()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = self.repositories.record_refresh(&repo.id, recorded) {
                warn!(repository = %repo.id, error = %e, "Failed to persist refresh outcome");
            }
            match outcome {
                Ok(count) => {
                    debug!(repository = %repo.id, entries = count, "Catalog refreshed");
                    report.refreshed.push(repo.id);
                }
                Err(e) => {
                    warn!(repository = %repo.id, error = %e, "Catalog refresh failed");
                    report.failed.insert(repo.id, e.to_string());
                }
            }
        }
        report.entries = self.catalogs.read().values().map(Vec::len).sum();
        report
    }

    async fn fetch_catalog(&self, repo: &Repository) -> Result<usize> {
        match self.client.catalog(repo).await {
            Ok(entries) => {
                self.metrics.record_catalog_refresh();
                let count = entries.len();
                self.catalogs.write().insert(repo.id.clone(), entries);
                Ok(count)
            }
            Err(e) => {
                self.metrics.record_catalog_failure();
                Err(e)
            }
        }
    }

    /// Find the repository and entry for a plugin
    ///
    /// Repositories without a loaded catalog are refreshed first; a
    /// repository that cannot be reached is skipped.
    pub async fn resolve(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
    ) -> Result<(Repository, RemotePluginMetadata)> {
        let mut last_error = None;
        for repo in self.repositories.enabled() {
            let loaded = self.catalogs.read().contains_key(&repo.id);
            if !loaded {
                if let Err(e) = self.fetch_catalog(&repo).await {
                    warn!(repository = %repo.id, error = %e, "Repository unavailable during resolution");
                    last_error = Some(e);
                    continue;
                }
            }
            let found = {
                let catalogs = self.catalogs.read();
                catalogs
                    .get(&repo.id)
                    .and_then(|entries| select_version(entries, plugin_id, version))
                    .cloned()
            };
            if let Some(entry) = found {
                debug!(plugin = plugin_id, version = %entry.version(), repository = %repo.id, "Resolved");
                return Ok((repo, entry));
            }
        }

        let wanted = match version {
            Some(v) => format!("{plugin_id}@{v}"),
            None => plugin_id.to_string(),
        };
        Err(match last_error {
            Some(e) => PluginError::plugin_not_found(plugin_id)
                .with_details(format!("{wanted} unresolved; last repository error: {}", e.kind()))
                .with_context(&e),
            None => PluginError::plugin_not_found(plugin_id),
        })
    }

    /// Search every enabled repository
    pub async fn search(&self, query: &str, category: Option<&str>) -> Vec<SearchHit> {
        let mut hits = Vec::new();
        for repo in self.repositories.enabled() {
            match self.client.search(&repo, query, category).await {
                Ok(entries) => hits.extend(entries.into_iter().map(|entry| SearchHit {
                    repository: repo.id.clone(),
                    entry,
                })),
                Err(e) => warn!(repository = %repo.id, error = %e, "Search failed"),
            }
        }
        hits
    }

    /// Versions of a plugin across enabled repositories, ascending
    pub async fn available_versions(&self, plugin_id: &str) -> Vec<Version> {
        let mut versions = BTreeSet::new();
        for repo in self.repositories.enabled() {
            match self.client.versions(&repo, plugin_id).await {
                Ok(found) => versions.extend(found),
                Err(e) => debug!(repository = %repo.id, error = %e, "Version listing failed"),
            }
        }
        versions.into_iter().collect()
    }

    /// Newer versions of installed plugins in the loaded catalogs
    pub async fn check_updates(&self) -> Vec<UpdateCandidate> {
        let mut candidates = Vec::new();
        for (plugin_id, installed) in self.installed.all() {
            match self.resolve(&plugin_id, None).await {
                Ok((repo, entry)) => {
                    if let Some(candidate) = UpdateCandidate::new(
                        plugin_id.clone(),
                        installed.version,
                        *entry.version(),
                        repo.id,
                    ) {
                        info!(
                            plugin = %plugin_id,
                            current = %candidate.current,
                            available = %candidate.available,
                            "Update available"
                        );
                        candidates.push(candidate);
                    }
                }
                Err(e) => debug!(plugin = %plugin_id, error = %e, "No update information"),
            }
        }
        candidates
    }

    /// Produce a verified artifact for a plugin
    pub async fn acquire(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
        cancel: &CancellationToken,
    ) -> Result<AcquiredArtifact> {
        if let Some(version) = version {
            if let Some(hit) = self.cache.lookup(plugin_id, Some(version)).await? {
                return Ok(AcquiredArtifact::from_cache(hit));
            }
        }

        let result = match self.resolve(plugin_id, version).await {
            Ok((repo, entry)) => {
                if version.is_none() {
                    if let Some(hit) = self.cache.lookup(plugin_id, Some(entry.version())).await? {
                        return Ok(AcquiredArtifact::from_cache(hit));
                    }
                }
                self.fetch(&repo, &entry, cancel).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(artifact) => Ok(artifact),
            Err(e) if self.may_fall_back(&e) => {
                match self.cache.lookup(plugin_id, version).await? {
                    Some(hit) => {
                        warn!(
                            plugin = plugin_id,
                            version = %hit.entry.version,
                            error = %e,
                            "Remote acquisition failed, serving cached copy"
                        );
                        Ok(AcquiredArtifact::from_cache(hit))
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn may_fall_back(&self, error: &PluginError) -> bool {
        self.config.fallback_to_cache
            && !matches!(
                error.kind(),
                ErrorKind::OperationCancelled
                    | ErrorKind::SecurityViolation
                    | ErrorKind::SignatureInvalid
                    | ErrorKind::UntrustedSource
            )
    }

    async fn fetch(
        &self,
        repo: &Repository,
        entry: &RemotePluginMetadata,
        cancel: &CancellationToken,
    ) -> Result<AcquiredArtifact> {
        let plugin_id = entry.id();
        let request = DownloadRequest {
            plugin_id: plugin_id.to_string(),
            repository: repo.clone(),
            url: self.client.download_url(repo, entry)?,
            expected_size: entry.size,
        };
        let artifact = self.downloads.download(&request, cancel).await?;

        if let Some(expected) = &entry.checksum {
            if !expected.eq_ignore_ascii_case(&artifact.sha256) {
                return Err(PluginError::security(format!("Checksum mismatch for {plugin_id}"))
                    .with_plugin(plugin_id)
                    .with_details(format!("expected: {expected}, actual: {}", artifact.sha256)));
            }
        }

        let requires_signature =
            self.config.security.require_signatures || repo.require_signatures || entry.signed;
        let validation = if requires_signature {
            let signature = self
                .client
                .signature(repo, plugin_id, entry.version())
                .await
                .map_err(|e| {
                    self.metrics.record_signature_failure();
                    PluginError::signature_invalid(format!("No usable signature for {plugin_id}"))
                        .with_plugin(plugin_id)
                        .with_details(e.to_string())
                })?;
            let record = self
                .verifier
                .verify_async(artifact.digest()?, signature, entry.publisher_id.clone())
                .await?;
            if !record.is_acceptable() {
                self.metrics.record_signature_failure();
                error!(plugin = plugin_id, message = %record.message, "Signature rejected");
            }
            record.into_result().map_err(|e| e.with_plugin(plugin_id))?
        } else {
            ValidationRecord::unsigned()
        };

        let cached = self.cache.insert(artifact, entry, Some(&repo.id))?;
        info!(
            plugin = plugin_id,
            version = %entry.version(),
            repository = %repo.id,
            validation = ?validation.level,
            "Artifact acquired"
        );
        Ok(AcquiredArtifact {
            plugin_id: plugin_id.to_string(),
            path: cached.path,
            version: *entry.version(),
            repository: repo.id.clone(),
            from_cache: false,
            validation: Some(validation),
        })
    }

    /// Record an installed artifact in the ledger
    pub fn record_install(&self, artifact: &AcquiredArtifact) -> Result<Option<InstalledPlugin>> {
        self.installed.record(
            &artifact.plugin_id,
            InstalledPlugin {
                version: artifact.version,
                source: artifact.repository.clone(),
                installed_at: Utc::now(),
                artifact_path: artifact.path.clone(),
            },
        )
    }

    /// Drop a plugin from the ledger and the cache
    pub fn uninstall(&self, plugin_id: &str) -> Result<Option<InstalledPlugin>> {
        let removed = self.installed.remove(plugin_id)?;
        if let Some(installed) = &removed {
            self.cache.remove(plugin_id, &installed.version)?;
            info!(plugin = plugin_id, version = %installed.version, "Plugin uninstalled");
        }
        Ok(removed)
    }

    /// Drop one cached version
    pub fn remove_cached(&self, plugin_id: &str, version: &Version) -> Result<bool> {
        self.cache.remove(plugin_id, version)
    }

    /// Start the cache sweeper and the catalog refresher
    pub fn start_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let sweeper = self.cache.spawn_sweeper(cancel.child_token());

        let pipeline = Arc::clone(self);
        let refresher = tokio::spawn(async move {
            loop {
                let period = pipeline.refresh_period();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        let report = pipeline.refresh_due().await;
                        if !report.failed.is_empty() {
                            warn!(failed = report.failed.len(), "Scheduled catalog refresh incomplete");
                        }
                    }
                }
            }
            debug!("Catalog refresher stopped");
        });

        vec![sweeper, refresher]
    }

    fn refresh_period(&self) -> Duration {
        self.repositories
            .enabled()
            .iter()
            .map(|r| r.update_interval)
            .min()
            .unwrap_or(Duration::from_secs(3600))
            .max(Duration::from_secs(1))
    }
}
