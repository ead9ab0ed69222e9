//! Bus statistics

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters; every read is lock-free
#[derive(Debug)]
pub struct BusStatistics {
    enabled: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    latency_nanos: AtomicU64,
    events_published: AtomicU64,
    requests: AtomicU64,
    request_failures: AtomicU64,
    request_timeouts: AtomicU64,
}

impl Default for BusStatistics {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Point-in-time copy of [`BusStatistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStatisticsSnapshot {
    /// Messages accepted by the publisher
    pub published: u64,
    /// Successful handler invocations
    pub delivered: u64,
    /// Handler invocations that failed
    pub failed: u64,
    /// Messages rejected because the queue was full
    pub dropped: u64,
    /// Messages whose deadline passed before delivery
    pub timed_out: u64,
    /// Mean enqueue-to-handled latency
    #[serde(with = "humantime_serde")]
    pub average_latency: Duration,
    /// Typed events published
    pub events_published: u64,
    /// Request/response calls
    pub requests: u64,
    /// Calls that returned an error
    pub request_failures: u64,
    /// Calls that exceeded their timeout
    pub request_timeouts: u64,
    /// Active subscriptions per type tag
    pub subscriptions_by_type: BTreeMap<String, usize>,
}

macro_rules! counter {
    ($($(#[$doc:meta])* $name:ident => $field:ident;)+) => {
        $(
            $(#[$doc])*
            pub fn $name(&self) {
                if self.enabled.load(Ordering::Relaxed) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            }
        )+
    };
}

impl BusStatistics {
    /// Create a collector
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            latency_nanos: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            request_failures: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
        }
    }

    /// Turn collection on or off
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    counter! {
        /// A message was accepted
        record_published => published;
        /// A handler failed
        record_failure => failed;
        /// A message was rejected by a full queue
        record_dropped => dropped;
        /// A message expired before delivery
        record_timeout => timed_out;
        /// A typed event was published
        record_event => events_published;
        /// A request was dispatched
        record_request => requests;
        /// A request failed
        record_request_failure => request_failures;
        /// A request timed out
        record_request_timeout => request_timeouts;
    }

    /// A handler succeeded `latency` after the message was enqueued
    pub fn record_delivery(&self, latency: Duration) {
        if self.enabled.load(Ordering::Relaxed) {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
            self.latency_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    /// Copy the counters
    pub fn snapshot(&self, subscriptions_by_type: BTreeMap<String, usize>) -> BusStatisticsSnapshot {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let average_latency = if delivered == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.latency_nanos.load(Ordering::Relaxed) / delivered)
        };

        BusStatisticsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered,
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            average_latency,
            events_published: self.events_published.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            subscriptions_by_type,
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.published,
            &self.delivered,
            &self.failed,
            &self.dropped,
            &self.timed_out,
            &self.latency_nanos,
            &self.events_published,
            &self.requests,
            &self.request_failures,
            &self.request_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
