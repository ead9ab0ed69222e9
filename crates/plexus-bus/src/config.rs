//! Bus configuration

use plexus_core::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the communication bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of the publisher queue
    pub max_queue_size: usize,

    /// How long a queued message may wait before it is dropped
    #[serde(with = "humantime_serde")]
    pub delivery_timeout: Duration,

    /// Retain published events for inspection
    pub enable_event_history: bool,

    /// Number of events retained
    pub max_event_history: usize,

    /// Timeout for request/response calls without an explicit one
    #[serde(with = "humantime_serde")]
    pub default_request_timeout: Duration,

    /// Calls allowed in flight at once
    pub max_concurrent_requests: usize,

    /// Collect counters
    pub enable_statistics: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            delivery_timeout: Duration::from_secs(5),
            enable_event_history: true,
            max_event_history: 1_000,
            default_request_timeout: Duration::from_secs(30),
            max_concurrent_requests: 64,
            enable_statistics: true,
        }
    }
}

impl BusConfig {
    /// Check bounds
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(PluginError::invalid_configuration("bus.max_queue_size must be > 0"));
        }
        if self.delivery_timeout.is_zero() {
            return Err(PluginError::invalid_configuration("bus.delivery_timeout must be > 0"));
        }
        if self.default_request_timeout.is_zero() {
            return Err(PluginError::invalid_configuration(
                "bus.default_request_timeout must be > 0",
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(PluginError::invalid_configuration(
                "bus.max_concurrent_requests must be > 0",
            ));
        }
        Ok(())
    }
}
