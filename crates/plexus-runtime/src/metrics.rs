//! Runtime counters

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lifecycle counters for the local runtime
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    loads: AtomicU64,
    load_failures: AtomicU64,
    initializations: AtomicU64,
    initialization_failures: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
    stops: AtomicU64,
    unloads: AtomicU64,
    load_durations: Mutex<BTreeMap<String, Duration>>,
}

/// Point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeMetricsSnapshot {
    /// Successful loads
    pub loads: u64,
    /// Failed loads
    pub load_failures: u64,
    /// Successful initializations
    pub initializations: u64,
    /// Failed initializations
    pub initialization_failures: u64,
    /// Successful hot reloads
    pub reloads: u64,
    /// Failed hot reloads
    pub reload_failures: u64,
    /// Completed stops
    pub stops: u64,
    /// Completed unloads
    pub unloads: u64,
    /// Most recent load duration per plugin
    #[serde(with = "duration_map")]
    pub load_durations: BTreeMap<String, Duration>,
}

mod duration_map {
    use serde::ser::SerializeMap;
    use serde::Serializer;
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        map: &BTreeMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            out.serialize_entry(k, &humantime_serde::Serde::from(*v))?;
        }
        out.end()
    }
}

impl RuntimeMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// A plugin loaded in `elapsed`
    pub fn record_load(&self, plugin_id: &str, elapsed: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_durations.lock().insert(plugin_id.to_string(), elapsed);
    }

    /// A load failed
    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An initialize() call finished
    pub fn record_initialization(&self, ok: bool) {
        if ok {
            self.initializations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.initialization_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A hot reload finished
    pub fn record_reload(&self, ok: bool) {
        if ok {
            self.reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A plugin stopped
    pub fn record_stop(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }

    /// A plugin was unloaded
    pub fn record_unload(&self, plugin_id: &str) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
        self.load_durations.lock().remove(plugin_id);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> RuntimeMetricsSnapshot {
        RuntimeMetricsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            initializations: self.initializations.load(Ordering::Relaxed),
            initialization_failures: self.initialization_failures.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
            stops: self.stops.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            load_durations: self.load_durations.lock().clone(),
        }
    }
}
