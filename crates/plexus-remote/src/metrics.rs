//! Pipeline counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the remote pipeline
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_invalidations: AtomicU64,
    cache_evictions: AtomicU64,
    network_fetches: AtomicU64,
    bytes_downloaded: AtomicU64,
    download_retries: AtomicU64,
    signature_failures: AtomicU64,
    catalog_refreshes: AtomicU64,
    catalog_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineMetricsSnapshot {
    /// Requests served from a valid cache entry
    pub cache_hits: u64,
    /// Requests that found no usable cache entry
    pub cache_misses: u64,
    /// Entries dropped because their checksum no longer matched
    pub cache_invalidations: u64,
    /// Entries dropped by the size cap or expiry
    pub cache_evictions: u64,
    /// Completed artifact downloads
    pub network_fetches: u64,
    /// Artifact bytes received
    pub bytes_downloaded: u64,
    /// Download attempts after the first
    pub download_retries: u64,
    /// Artifacts rejected by signature verification
    pub signature_failures: u64,
    /// Successful catalog refreshes
    pub catalog_refreshes: u64,
    /// Failed catalog refreshes
    pub catalog_failures: u64,
}

macro_rules! counters {
    ($($record:ident => $field:ident),* $(,)?) => {
        impl PipelineMetrics {
            $(
                #[doc = concat!("Increment `", stringify!($field), "`")]
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counters! {
    record_cache_hit => cache_hits,
    record_cache_miss => cache_misses,
    record_cache_invalidation => cache_invalidations,
    record_network_fetch => network_fetches,
    record_download_retry => download_retries,
    record_signature_failure => signature_failures,
    record_catalog_refresh => catalog_refreshes,
    record_catalog_failure => catalog_failures,
}

impl PipelineMetrics {
    /// Add evicted entries
    pub fn record_evictions(&self, count: u64) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Add downloaded bytes
    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_invalidations: self.cache_invalidations.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            download_retries: self.download_retries.load(Ordering::Relaxed),
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
            catalog_refreshes: self.catalog_refreshes.load(Ordering::Relaxed),
            catalog_failures: self.catalog_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = PipelineMetrics::default();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_invalidation();
        metrics.record_evictions(3);
        metrics.record_bytes(1024);

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_invalidations, 1);
        assert_eq!(snap.cache_evictions, 3);
        assert_eq!(snap.bytes_downloaded, 1024);
        assert_eq!(snap.network_fetches, 0);
    }
}
