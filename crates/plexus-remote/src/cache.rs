//! Content-addressed plugin cache
//!
//! Layout under the cache directory:
//!
//! ```text
//! index.json
//! plugins/<plugin id>/<version>/<artifact>
//! plugins/<plugin id>/<version>/<artifact stem>.json
//! ```
//!
//! Each artifact sits next to its metadata document so the runtime loader
//! can load it in place. Every lookup re-hashes the artifact; an entry whose
//! bytes no longer match the recorded checksum is dropped and reported as a
//! miss. The total size is capped, evicting least recently used entries.
//!
//! Access bookkeeping from lookups stays in memory until the next structural
//! change, a sweep, or an explicit [`PluginCache::flush`].

use crate::config::CacheConfig;
use crate::download::DownloadedArtifact;
use crate::fs::{read_json, sha256_file, write_atomic, write_json};
use crate::metrics::PipelineMetrics;
use crate::repository::RemotePluginMetadata;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plexus_core::{PluginError, Result, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// File name of the cache index
pub const INDEX_FILE: &str = "index.json";

/// One cached artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Plugin id
    pub plugin_id: String,
    /// Plugin version
    pub version: Version,
    /// Artifact file name
    pub filename: String,
    /// Lowercase hex SHA-256 of the artifact
    pub checksum: String,
    /// Artifact size in bytes
    pub size: u64,
    /// When the entry was written
    pub cached_at: DateTime<Utc>,
    /// Last lookup hit
    pub last_accessed: DateTime<Utc>,
    /// Lookup hits
    #[serde(default)]
    pub access_count: u64,
    /// Entries past this instant are swept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Cleared when verification fails
    #[serde(default = "default_true")]
    pub valid: bool,
    /// Repository the artifact came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

fn default_true() -> bool {
    true
}

impl CacheEntry {
    fn key(&self) -> String {
        entry_key(&self.plugin_id, &self.version)
    }

    /// Whether the entry has outlived its TTL
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

fn entry_key(plugin_id: &str, version: &Version) -> String {
    format!("{plugin_id}@{version}")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

/// A verified cache hit
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    /// Artifact path, loadable by the runtime
    pub path: PathBuf,
    /// Index entry after the hit was recorded
    pub entry: CacheEntry,
}

/// Cache occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of entries
    pub entries: usize,
    /// Bytes used by artifacts
    pub total_size: u64,
    /// Configured cap
    pub max_size: u64,
}

/// Verified on-disk artifact cache
#[derive(Debug)]
pub struct PluginCache {
    root: PathBuf,
    config: CacheConfig,
    index: RwLock<CacheIndex>,
    dirty: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

impl PluginCache {
    /// Open the cache, creating the directory and loading the index
    pub fn open(config: CacheConfig, metrics: Arc<PipelineMetrics>) -> Result<Self> {
        let root = config.directory.clone();
        std::fs::create_dir_all(root.join("plugins"))?;
        let index = match read_json::<CacheIndex>(&root.join(INDEX_FILE)) {
            Ok(index) => index.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Cache index unreadable, starting empty");
                CacheIndex::default()
            }
        };
        info!(dir = %root.display(), entries = index.entries.len(), "Plugin cache opened");
        Ok(Self {
            root,
            config,
            index: RwLock::new(index),
            dirty: AtomicBool::new(false),
            metrics,
        })
    }

    /// Cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for partial downloads
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn entry_dir(&self, plugin_id: &str, version: &Version) -> PathBuf {
        self.root
            .join("plugins")
            .join(plugin_id)
            .join(version.to_string())
    }

    fn entry_path(&self, entry: &CacheEntry) -> PathBuf {
        self.entry_dir(&entry.plugin_id, &entry.version)
            .join(&entry.filename)
    }

    fn persist_index(&self, index: &CacheIndex) -> Result<()> {
        let written = write_json(&self.root.join(INDEX_FILE), index);
        self.dirty.store(written.is_err(), Ordering::Release);
        written
    }

    /// Write pending access bookkeeping to the index file
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let index = self.index.read();
        self.persist_index(&index)
    }

    /// All entries
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index.read().entries.values().cloned().collect()
    }

    /// Occupancy
    pub fn stats(&self) -> CacheStats {
        let index = self.index.read();
        CacheStats {
            entries: index.entries.len(),
            total_size: index.entries.values().map(|e| e.size).sum(),
            max_size: self.config.max_size_bytes,
        }
    }

    /// Find a verified artifact
    ///
    /// With no version the highest cached version is returned. Expired
    /// entries are treated as misses; entries failing verification are
    /// removed.
    pub async fn lookup(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
    ) -> Result<Option<CachedArtifact>> {
        let now = Utc::now();
        let candidate = {
            let index = self.index.read();
            index
                .entries
                .values()
                .filter(|e| e.plugin_id == plugin_id && e.valid && !e.is_expired(now))
                .filter(|e| version.map(|v| &e.version == v).unwrap_or(true))
                .max_by(|a, b| a.version.cmp(&b.version))
                .cloned()
        };
        let Some(entry) = candidate else {
            self.metrics.record_cache_miss();
            return Ok(None);
        };

        let path = self.entry_path(&entry);
        let hash_path = path.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&hash_path))
            .await
            .map_err(|e| PluginError::threading(format!("Checksum task failed: {e}")))?;

        match actual {
            Ok(sum) if sum.eq_ignore_ascii_case(&entry.checksum) => {}
            outcome => {
                warn!(
                    plugin = plugin_id,
                    version = %entry.version,
                    error = ?outcome.err().map(|e| e.to_string()),
                    "Cached artifact failed verification, invalidating"
                );
                self.remove_entry(&entry.key())?;
                self.metrics.record_cache_invalidation();
                self.metrics.record_cache_miss();
                return Ok(None);
            }
        }

        let entry = {
            let mut index = self.index.write();
            let Some(current) = index.entries.get_mut(&entry.key()) else {
                self.metrics.record_cache_miss();
                return Ok(None);
            };
            current.last_accessed = Utc::now();
            current.access_count += 1;
            self.dirty.store(true, Ordering::Release);
            current.clone()
        };
        self.metrics.record_cache_hit();
        debug!(plugin = plugin_id, version = %entry.version, "Cache hit");
        Ok(Some(CachedArtifact { path, entry }))
    }

    /// Store a verified download
    ///
    /// The artifact is moved into place, its metadata written beside it and
    /// the size cap enforced. The new entry itself is never evicted. If any
    /// step fails the entry's files are removed and the index is left as it
    /// was, minus any entry whose files the new artifact overwrote.
    pub fn insert(
        &self,
        artifact: DownloadedArtifact,
        remote: &RemotePluginMetadata,
        repository: Option<&str>,
    ) -> Result<CachedArtifact> {
        let filename = remote.artifact_filename();
        if Path::new(&filename).file_name().map(|f| f != filename.as_str()).unwrap_or(true) {
            return Err(PluginError::security(format!(
                "Artifact name '{filename}' is not a plain file name"
            )));
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.default_ttl).ok();
        let entry = CacheEntry {
            plugin_id: remote.id().to_string(),
            version: *remote.version(),
            filename,
            checksum: artifact.sha256.clone(),
            size: artifact.size,
            cached_at: now,
            last_accessed: now,
            access_count: 0,
            expires_at: ttl.filter(|d| !d.is_zero()).map(|d| now + d),
            valid: true,
            repository: repository.map(str::to_string),
        };

        let path = self.entry_path(&entry);
        if let Err(e) = store_files(artifact, remote, &path) {
            self.abandon(&entry);
            return Err(e);
        }

        let evicted = {
            let mut index = self.index.write();
            index.entries.insert(entry.key(), entry.clone());
            let evicted = self.evict_over_cap(&mut index, &entry.key());
            if let Err(e) = self.persist_index(&index) {
                index.entries.remove(&entry.key());
                for old in &evicted {
                    index.entries.insert(old.key(), old.clone());
                }
                drop(index);
                warn!(
                    plugin = %entry.plugin_id,
                    version = %entry.version,
                    error = %e,
                    "Cache index write failed, discarding artifact"
                );
                self.remove_files(&entry);
                return Err(e);
            }
            evicted
        };
        for old in &evicted {
            self.remove_files(old);
        }
        if !evicted.is_empty() {
            self.metrics.record_evictions(evicted.len() as u64);
            info!(evicted = evicted.len(), "Cache size cap enforced");
        }

        info!(
            plugin = %entry.plugin_id,
            version = %entry.version,
            size = entry.size,
            "Artifact cached"
        );
        Ok(CachedArtifact { path, entry })
    }

    /// Undo a partially stored entry
    fn abandon(&self, entry: &CacheEntry) {
        self.remove_files(entry);
        let mut index = self.index.write();
        if index.entries.remove(&entry.key()).is_some() {
            // Its files are gone either way
            if let Err(e) = self.persist_index(&index) {
                warn!(error = %e, "Failed to persist cache index");
            }
        }
    }

    /// Drop least recently used entries until the total fits the cap
    fn evict_over_cap(&self, index: &mut CacheIndex, keep: &str) -> Vec<CacheEntry> {
        let mut total: u64 = index.entries.values().map(|e| e.size).sum();
        if total <= self.config.max_size_bytes {
            return Vec::new();
        }
        let mut by_age: Vec<(DateTime<Utc>, String)> = index
            .entries
            .iter()
            .filter(|(key, _)| key.as_str() != keep)
            .map(|(key, e)| (e.last_accessed, key.clone()))
            .collect();
        by_age.sort();

        let mut evicted = Vec::new();
        for (_, key) in by_age {
            if total <= self.config.max_size_bytes {
                break;
            }
            if let Some(entry) = index.entries.remove(&key) {
                total = total.saturating_sub(entry.size);
                evicted.push(entry);
            }
        }
        evicted
    }

    fn remove_files(&self, entry: &CacheEntry) {
        let dir = self.entry_dir(&entry.plugin_id, &entry.version);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Failed to remove cache entry files");
            }
        }
    }

    fn remove_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let removed = {
            let mut index = self.index.write();
            let removed = index.entries.remove(key);
            if removed.is_some() {
                self.persist_index(&index)?;
            }
            removed
        };
        if let Some(entry) = &removed {
            self.remove_files(entry);
        }
        Ok(removed)
    }

    /// Remove one version
    pub fn remove(&self, plugin_id: &str, version: &Version) -> Result<bool> {
        Ok(self.remove_entry(&entry_key(plugin_id, version))?.is_some())
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<CacheEntry> = {
            let mut index = self.index.write();
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now) || !e.valid)
                .map(|(k, _)| k.clone())
                .collect();
            let expired: Vec<CacheEntry> = keys
                .iter()
                .filter_map(|k| index.entries.remove(k))
                .collect();
            if !expired.is_empty() {
                self.persist_index(&index)?;
            }
            expired
        };
        for entry in &expired {
            self.remove_files(entry);
        }
        if !expired.is_empty() {
            self.metrics.record_evictions(expired.len() as u64);
            debug!(removed = expired.len(), "Cleaned up expired cache entries");
        }
        Ok(expired.len())
    }

    /// Remove everything
    pub fn clear(&self) -> Result<()> {
        let entries: Vec<CacheEntry> = {
            let mut index = self.index.write();
            let entries = std::mem::take(&mut index.entries);
            self.persist_index(&index)?;
            entries.into_values().collect()
        };
        for entry in &entries {
            self.remove_files(entry);
        }
        Ok(())
    }

    /// Periodically sweep expired entries until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.cleanup_expired().and_then(|_| cache.flush()) {
                            warn!(error = %e, "Cache sweep failed");
                        }
                    }
                }
            }
            if let Err(e) = cache.flush() {
                warn!(error = %e, "Cache index flush failed");
            }
            debug!("Cache sweeper stopped");
        })
    }
}

fn store_files(artifact: DownloadedArtifact, remote: &RemotePluginMetadata, path: &Path) -> Result<()> {
    artifact.persist(path)?;
    write_atomic(&path.with_extension("json"), remote.metadata.to_json()?.as_bytes())
}
