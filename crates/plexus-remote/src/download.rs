//! Download manager
//!
//! Transfers are bounded by a semaphore and written to a temporary file in
//! the staging directory. Failed transfers are retried with exponential
//! backoff; when a partial body was received the retry asks for the rest
//! with a `Range` request and appends if the server answers 206. Cancelling
//! aborts the transfer and drops the partial file.

use crate::client::{http_error, RepositoryClient};
use crate::config::DownloadConfig;
use crate::fs::sha256_file;
use crate::metrics::PipelineMetrics;
use crate::repository::Repository;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use plexus_core::{ErrorKind, PluginError, Result};
use plexus_recovery::RetryPolicy;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use serde::Serialize;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// What to download
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Plugin the artifact belongs to
    pub plugin_id: String,
    /// Repository supplying credentials
    pub repository: Repository,
    /// Artifact URL
    pub url: Url,
    /// Size advertised by the catalog
    pub expected_size: Option<u64>,
}

/// Live progress of one transfer
#[derive(Debug)]
pub struct DownloadProgress {
    plugin_id: String,
    url: Url,
    bytes_received: AtomicU64,
    bytes_total: AtomicU64,
    started_at: DateTime<Utc>,
    retries: AtomicU32,
}

/// Point-in-time copy of [`DownloadProgress`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadStatus {
    /// Plugin id
    pub plugin_id: String,
    /// Artifact URL
    pub url: String,
    /// Bytes written so far
    pub bytes_received: u64,
    /// Total size, if known
    pub bytes_total: Option<u64>,
    /// When the transfer started
    pub started_at: DateTime<Utc>,
    /// Attempts after the first
    pub retries: u32,
}

impl DownloadProgress {
    fn new(request: &DownloadRequest) -> Self {
        Self {
            plugin_id: request.plugin_id.clone(),
            url: request.url.clone(),
            bytes_received: AtomicU64::new(0),
            bytes_total: AtomicU64::new(request.expected_size.unwrap_or(0)),
            started_at: Utc::now(),
            retries: AtomicU32::new(0),
        }
    }

    /// Current values
    pub fn status(&self) -> DownloadStatus {
        let total = self.bytes_total.load(Ordering::Relaxed);
        DownloadStatus {
            plugin_id: self.plugin_id.clone(),
            url: self.url.to_string(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_total: (total > 0).then_some(total),
            started_at: self.started_at,
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// A completed download, still in its temporary file
#[derive(Debug)]
pub struct DownloadedArtifact {
    file: NamedTempFile,
    /// Bytes received
    pub size: u64,
    /// Lowercase hex SHA-256
    pub sha256: String,
    /// Attempts after the first
    pub retries: u32,
}

impl DownloadedArtifact {
    #[cfg(test)]
    pub(crate) fn from_parts(file: NamedTempFile, size: u64, sha256: String) -> Self {
        Self {
            file,
            size,
            sha256,
            retries: 0,
        }
    }

    /// Temporary location
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Raw SHA-256 digest
    pub fn digest(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.sha256)
            .map_err(|e| PluginError::invalid_format(format!("Invalid digest: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| PluginError::invalid_format("Digest is not 32 bytes"))
    }

    /// Move the file to `dest`, replacing anything there
    pub fn persist(self, dest: &Path) -> Result<()> {
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.file.persist(dest).map_err(|e| {
            PluginError::filesystem(format!("Failed to move download to {}: {}", dest.display(), e.error))
        })?;
        Ok(())
    }
}

/// Bounded, resumable, cancellable downloads
#[derive(Debug)]
pub struct DownloadManager {
    client: RepositoryClient,
    config: DownloadConfig,
    staging_dir: PathBuf,
    semaphore: Arc<Semaphore>,
    active: DashMap<String, Arc<DownloadProgress>>,
    metrics: Arc<PipelineMetrics>,
}

impl DownloadManager {
    /// Create a manager writing partial files to `staging_dir`
    pub fn new(
        client: RepositoryClient,
        config: DownloadConfig,
        staging_dir: impl Into<PathBuf>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            client,
            config,
            staging_dir: staging_dir.into(),
            semaphore,
            active: DashMap::new(),
            metrics,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries + 1)
            .with_initial_delay(self.config.retry_delay)
            .with_max_delay(self.config.retry_delay * 32)
            .retry_on([
                ErrorKind::NetworkError,
                ErrorKind::Timeout,
                ErrorKind::ResourceUnavailable,
            ])
    }

    /// In-flight transfers
    pub fn active(&self) -> Vec<DownloadStatus> {
        self.active.iter().map(|e| e.value().status()).collect()
    }

    /// Free transfer slots
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Download an artifact, retrying transient failures
    ///
    /// Exhausted retries return `NetworkError` with the retry count in its
    /// details; cancellation returns `OperationCancelled`.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(request)),
            permit = self.semaphore.acquire() => permit
                .map_err(|_| PluginError::invalid_state("Download manager is closed"))?,
        };

        let key = format!("{}@{}", request.plugin_id, request.url);
        let progress = Arc::new(DownloadProgress::new(request));
        self.active.insert(key.clone(), Arc::clone(&progress));
        let result = self.download_with_retries(request, &progress, cancel).await;
        self.active.remove(&key);
        result
    }

    async fn download_with_retries(
        &self,
        request: &DownloadRequest,
        progress: &DownloadProgress,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let mut file = NamedTempFile::new_in(&self.staging_dir)?;
        let policy = self.retry_policy();
        let mut attempt = 1;

        loop {
            let result = self.transfer(request, file.as_file_mut(), progress, cancel).await;
            match result {
                Ok(size) => {
                    let path = file.path().to_path_buf();
                    let sha256 = tokio::task::spawn_blocking(move || sha256_file(&path))
                        .await
                        .map_err(|e| PluginError::threading(format!("Checksum task failed: {e}")))??;
                    self.metrics.record_network_fetch();
                    info!(
                        plugin = %request.plugin_id,
                        bytes = size,
                        retries = attempt - 1,
                        "Download complete"
                    );
                    return Ok(DownloadedArtifact {
                        file,
                        size,
                        sha256,
                        retries: attempt - 1,
                    });
                }
                Err(e) if e.is(ErrorKind::OperationCancelled) => {
                    info!(plugin = %request.plugin_id, "Download cancelled");
                    return Err(e);
                }
                Err(e) if !policy.should_retry(&e) => return Err(e),
                Err(e) if attempt >= policy.max_attempts => {
                    warn!(plugin = %request.plugin_id, attempts = attempt, error = %e, "Download failed");
                    return Err(retries_exhausted(request, attempt - 1, e));
                }
                Err(e) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        plugin = %request.plugin_id,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Download attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(cancelled(request)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                    progress.retries.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_download_retry();
                }
            }
        }
    }

    /// One HTTP exchange; resumes from the bytes already in `file`
    async fn transfer(
        &self,
        request: &DownloadRequest,
        file: &mut std::fs::File,
        progress: &DownloadProgress,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut received = file.metadata()?.len();
        let mut builder = self.client.get(&request.repository, &request.url)?;
        if received > 0 {
            builder = builder.header(RANGE, format!("bytes={received}-"));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(request)),
            r = tokio::time::timeout(self.config.read_timeout, self.client.send(builder, &request.url)) => r
                .map_err(|_| PluginError::timeout(format!("No response from {}", request.url)))??,
        };

        if received > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            debug!(plugin = %request.plugin_id, "Server ignored range request; restarting");
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            received = 0;
        } else if received > 0 {
            debug!(plugin = %request.plugin_id, offset = received, "Resuming download");
            file.seek(SeekFrom::End(0))?;
        }

        let remaining = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let total = remaining.map(|r| r + received).or(request.expected_size);
        if let Some(total) = total {
            self.check_size(total)?;
            progress.bytes_total.store(total, Ordering::Relaxed);
        }
        progress.bytes_received.store(received, Ordering::Relaxed);

        let mut response = response;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(request)),
                c = tokio::time::timeout(self.config.read_timeout, response.chunk()) => c
                    .map_err(|_| PluginError::timeout(format!("Read timed out: {}", request.url)))?
                    .map_err(http_error)?,
            };
            let Some(chunk) = chunk else { break };
            received += chunk.len() as u64;
            self.check_size(received)?;
            file.write_all(&chunk)?;
            self.metrics.record_bytes(chunk.len() as u64);
            progress.bytes_received.store(received, Ordering::Relaxed);
        }
        file.flush()?;

        if let Some(expected) = request.expected_size {
            if received < expected {
                return Err(PluginError::network(format!(
                    "Transfer ended early: {received} of {expected} bytes"
                )));
            }
            if received > expected {
                file.set_len(0)?;
                return Err(PluginError::security(format!(
                    "Artifact larger than advertised: {received} > {expected} bytes"
                )));
            }
        }
        Ok(received)
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.config.max_file_size {
            return Err(PluginError::resource_exhausted(format!(
                "Artifact exceeds max file size ({size} > {} bytes)",
                self.config.max_file_size
            )));
        }
        Ok(())
    }
}

/// Final error of a download whose retries ran out: always `NetworkError`,
/// with the last attempt's error kept as context
fn retries_exhausted(request: &DownloadRequest, retries: u32, last: PluginError) -> PluginError {
    PluginError::network(format!(
        "Download of {} failed after {} attempts",
        request.plugin_id,
        retries + 1
    ))
    .with_details(format!(
        "retries: {retries}, url: {}, last error: {}",
        request.url,
        last.kind()
    ))
    .with_context(&last)
    .with_plugin(request.plugin_id.as_str())
}

fn cancelled(request: &DownloadRequest) -> PluginError {
    PluginError::cancelled(format!("Download of {} cancelled", request.plugin_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UrlPolicyConfig;
    use crate::url_policy::UrlPolicy;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(dir: &Path, config: DownloadConfig) -> DownloadManager {
        let policy = UrlPolicy::new(UrlPolicyConfig {
            allowed_schemes: vec!["http".to_string()],
            ..UrlPolicyConfig::default()
        });
        let client = RepositoryClient::new(&config, policy).unwrap();
        DownloadManager::new(client, config, dir, Arc::new(PipelineMetrics::default()))
    }

    fn fast() -> DownloadConfig {
        DownloadConfig {
            retry_delay: Duration::from_millis(5),
            max_retries: 2,
            ..DownloadConfig::default()
        }
    }

    fn request(server: &MockServer, expected_size: Option<u64>) -> DownloadRequest {
        DownloadRequest {
            plugin_id: "com.example.a".to_string(),
            repository: Repository::new("main", &server.uri()).unwrap(),
            url: Url::parse(&format!("{}/artifact", server.uri())).unwrap(),
            expected_size,
        }
    }

    #[tokio::test]
    async fn test_download_computes_checksum() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), fast());
        let artifact = downloads
            .download(&request(&server, Some(3)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(artifact.size, 3);
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(artifact.retries, 0);
        assert!(downloads.active().is_empty());

        let dest = dir.path().join("final/a.bin");
        artifact.persist(&dest).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_resume_with_range_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .and(header("range", "bytes=4-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"5678".to_vec()))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"1234".to_vec()))
            .up_to_n_times(1)
            .with_priority(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), fast());
        let artifact = downloads
            .download(&request(&server, Some(8)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"12345678");
        assert_eq!(artifact.retries, 1);
    }

    #[tokio::test]
    async fn test_retry_cap_reports_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), fast());
        let err = downloads
            .download(&request(&server, None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(err.details().unwrap().contains("retries: 2"));
        assert_eq!(downloads.metrics.snapshot().download_retries, 2);
    }

    #[tokio::test]
    async fn test_retry_cap_on_unavailable_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), fast());
        let err = downloads
            .download(&request(&server, None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        let details = err.details().unwrap();
        assert!(details.contains("retries: 2"));
        assert!(details.contains(&ErrorKind::ResourceUnavailable.to_string()));
        assert_eq!(err.plugin_id(), Some("com.example.a"));
    }

    #[tokio::test]
    async fn test_retry_cap_on_timeout_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(
            dir.path(),
            DownloadConfig {
                read_timeout: Duration::from_millis(50),
                max_retries: 1,
                ..fast()
            },
        );
        let err = downloads
            .download(&request(&server, None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(err.details().unwrap().contains("retries: 1"));
        assert!(err.context().unwrap().contains(&ErrorKind::Timeout.to_string()));
        assert_eq!(downloads.metrics.snapshot().download_retries, 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let downloads = manager(&staging, fast());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = downloads
            .download(&request(&server, None), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationCancelled);
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_artifact_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(
            dir.path(),
            DownloadConfig {
                max_file_size: 16,
                ..fast()
            },
        );
        let err = downloads
            .download(&request(&server, None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }
}
