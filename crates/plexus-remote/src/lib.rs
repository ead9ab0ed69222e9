//! # Plexus Remote
//!
//! Remote plugin acquisition for the Plexus host.
//!
//! ## Features
//!
//! - **Repositories**: prioritised remote sources with bearer authentication,
//!   catalog refresh, search and version listing
//! - **Downloads**: bounded concurrency, resumable range requests, retry with
//!   backoff and cancellation
//! - **Content Cache**: checksum-verified on every hit, LRU size cap, periodic
//!   expiry sweep
//! - **Signatures**: detached RSA / ECDSA / Ed25519 signatures checked against
//!   a trust store of publisher certificates
//! - **URL Policy**: scheme set, host allowlist and denylist, redirect limit
//! - **Updates**: update discovery under an auto-update policy, install ledger
//!
//! Persisted state under the cache directory:
//!
//! ```text
//! index.json            cache manifest
//! plugins/<pid>/<ver>/  cached artifacts and their metadata
//! trust/<publisher>.crt trusted publisher certificates
//! repositories.json     configured repositories
//! installed.json        installed plugins
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_remote::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<()> {
//! let pipeline = RemotePipeline::open(RemoteConfig::default().with_cache_dir("/var/cache/plexus"))?;
//! pipeline.add_repository(Repository::new("main", "https://plugins.example.com/api/")?)?;
//! pipeline.refresh_catalogs().await;
//!
//! let artifact = pipeline
//!     .acquire("com.example.logger", None, &CancellationToken::new())
//!     .await?;
//! println!("{} {} at {}", artifact.plugin_id, artifact.version, artifact.path.display());
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

pub mod cache;
pub mod client;
pub mod config;
pub mod download;
mod fs;
pub mod installed;
pub mod metrics;
pub mod pipeline;
pub mod repository;
pub mod signature;
pub mod update;
pub mod url_policy;

pub use cache::{CacheEntry, CacheStats, CachedArtifact, PluginCache};
pub use client::{http_error, status_error, RepositoryClient};
pub use config::{
    CacheConfig, DownloadConfig, RemoteConfig, SecurityConfig, UpdateConfig, UrlPolicyConfig,
};
pub use download::{DownloadManager, DownloadRequest, DownloadStatus, DownloadedArtifact};
pub use installed::{InstalledPlugin, InstalledRegistry};
pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use pipeline::{AcquiredArtifact, CatalogRefreshReport, RemotePipeline, SearchHit};
pub use repository::{RemotePluginMetadata, Repository, RepositoryRegistry};
pub use signature::{
    DetachedSignature, PublisherCertificate, SignatureAlgorithm, SignatureVerifier, TrustLevel,
    TrustStore, ValidationLevel, ValidationRecord,
};
pub use update::{UpdateCandidate, UpdatePolicy};
pub use url_policy::UrlPolicy;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::config::RemoteConfig;
    pub use crate::pipeline::{AcquiredArtifact, RemotePipeline};
    pub use crate::repository::Repository;
    pub use crate::signature::{PublisherCertificate, TrustLevel, ValidationLevel};
    pub use crate::update::{UpdateCandidate, UpdatePolicy};
    pub use plexus_core::{PluginError, Result};
}
