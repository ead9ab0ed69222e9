//! Configuration types

use plexus_bus::BusConfig;
use plexus_recovery::{CircuitBreakerConfig, RetryPolicy};
use plexus_remote::{RemoteConfig, Repository};
use plexus_runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};

/// Complete host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Communication bus
    pub bus: BusConfig,

    /// Local runtime: search paths, timeouts, hot reload
    pub runtime: RuntimeConfig,

    /// Remote pipeline: cache, downloads, URL policy, signatures, updates
    pub remote: RemoteConfig,

    /// Defaults for wrapped workflow operations
    pub recovery: RecoveryConfig,

    /// Repositories registered at startup
    pub repositories: Vec<Repository>,
}

/// Recovery defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Retry policy for operations without their own
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
}
