//! Request/response endpoints
//!
//! Endpoints are named handlers plugins expose for direct calls. A call never
//! passes through the publisher queue: the blocking form invokes the handler
//! on the caller's thread, the async form runs it on the blocking pool under a
//! timeout. Both share one concurrency limit.

use crate::stats::BusStatistics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plexus_core::{PluginError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Endpoint callback
pub type RequestHandler = Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

#[derive(Clone)]
struct Endpoint {
    provider: String,
    handler: RequestHandler,
    registered_at: DateTime<Utc>,
}

/// Description of a registered endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    /// Endpoint name
    pub name: String,
    /// Providing plugin id
    pub provider: String,
    /// Registration time
    pub registered_at: DateTime<Utc>,
}

/// Registry and dispatcher for request/response endpoints
pub struct RequestResponseService {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    default_timeout: Duration,
    stats: Arc<BusStatistics>,
}

impl std::fmt::Debug for RequestResponseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseService")
            .field("endpoints", &self.endpoints.read().len())
            .field("max_concurrent", &self.max_concurrent)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

fn panic_reason(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn invoke(name: &str, endpoint: &Endpoint, request: serde_json::Value) -> Result<serde_json::Value> {
    match catch_unwind(AssertUnwindSafe(|| (endpoint.handler)(request))) {
        Ok(result) => result,
        Err(panic) => Err(PluginError::execution_failed(format!(
            "Endpoint {name} panicked: {}",
            panic_reason(panic)
        ))
        .with_plugin(endpoint.provider.as_str())),
    }
}

impl RequestResponseService {
    /// Create a service
    pub fn new(default_timeout: Duration, max_concurrent: usize, stats: Arc<BusStatistics>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            endpoints: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            default_timeout,
            stats,
        }
    }

    /// Register an endpoint; names are unique across providers
    pub fn register(&self, provider: &str, name: &str, handler: RequestHandler) -> Result<()> {
        if name.trim().is_empty() {
            return Err(PluginError::invalid_argument("Endpoint name is empty"));
        }
        let mut endpoints = self.endpoints.write();
        if let Some(existing) = endpoints.get(name) {
            return Err(PluginError::already_exists(format!(
                "Endpoint {name} (provided by {})",
                existing.provider
            ))
            .with_plugin(provider));
        }
        endpoints.insert(
            name.to_string(),
            Endpoint {
                provider: provider.to_string(),
                handler,
                registered_at: Utc::now(),
            },
        );
        drop(endpoints);

        info!(endpoint = %name, provider = %provider, "Endpoint registered");
        Ok(())
    }

    /// Remove an endpoint
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.endpoints.write().remove(name).is_some();
        if removed {
            debug!(endpoint = %name, "Endpoint unregistered");
        }
        removed
    }

    /// Remove every endpoint `provider` registered
    pub fn unregister_provider(&self, provider: &str) -> Vec<String> {
        let mut endpoints = self.endpoints.write();
        let mut names: Vec<String> = endpoints
            .iter()
            .filter(|(_, e)| e.provider == provider)
            .map(|(n, _)| n.clone())
            .collect();
        for name in &names {
            endpoints.remove(name);
        }
        names.sort();
        names
    }

    /// Atomically swap everything `provider` registered for `replacement`
    pub fn replace_provider(&self, provider: &str, replacement: Vec<(String, RequestHandler)>) -> Result<()> {
        let mut endpoints = self.endpoints.write();
        for (name, _) in &replacement {
            if let Some(existing) = endpoints.get(name) {
                if existing.provider != provider {
                    return Err(PluginError::already_exists(format!(
                        "Endpoint {name} (provided by {})",
                        existing.provider
                    ))
                    .with_plugin(provider));
                }
            }
        }
        endpoints.retain(|_, e| e.provider != provider);
        let now = Utc::now();
        for (name, handler) in replacement {
            endpoints.insert(
                name,
                Endpoint {
                    provider: provider.to_string(),
                    handler,
                    registered_at: now,
                },
            );
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Endpoint> {
        self.endpoints
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::not_found(format!("Endpoint {name}")))
    }

    fn record(&self, result: &Result<serde_json::Value>) {
        if let Err(e) = result {
            if e.is(plexus_core::ErrorKind::Timeout) {
                self.stats.record_request_timeout();
            } else {
                self.stats.record_request_failure();
            }
        }
    }

    /// Call an endpoint on the current thread.
    ///
    /// The handler cannot be pre-empted; if it overruns the timeout its
    /// result is discarded and `Timeout` is returned.
    pub fn call(&self, name: &str, request: serde_json::Value, timeout: Option<Duration>) -> Result<serde_json::Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let endpoint = self.lookup(name)?;
        self.stats.record_request();

        let _permit = self.permits.try_acquire().map_err(|_| {
            PluginError::resource_exhausted(format!(
                "Too many concurrent requests (limit {})",
                self.max_concurrent
            ))
        })?;

        let started = Instant::now();
        let mut result = invoke(name, &endpoint, request);
        if started.elapsed() > timeout {
            warn!(endpoint = %name, elapsed = ?started.elapsed(), "Endpoint overran its timeout");
            result = Err(PluginError::timeout(format!("Endpoint {name} exceeded {timeout:?}"))
                .with_plugin(endpoint.provider.as_str()));
        }
        self.record(&result);
        result
    }

    /// Call an endpoint without blocking the async caller
    pub async fn call_async(
        &self,
        name: &str,
        request: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let endpoint = self.lookup(name)?;
        self.stats.record_request();
        let deadline = tokio::time::Instant::now() + timeout;

        let result = async {
            let permit = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
                .await
                .map_err(|_| PluginError::timeout(format!("Waiting for a request slot for {name}")))?
                .map_err(|_| PluginError::invalid_state("Request service is shut down"))?;

            let call_name = name.to_string();
            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                invoke(&call_name, &endpoint, request)
            });

            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(PluginError::execution_failed(format!(
                    "Endpoint {name} task failed: {join}"
                ))),
                Err(_) => Err(PluginError::timeout(format!("Endpoint {name} exceeded {timeout:?}"))),
            }
        }
        .await;

        self.record(&result);
        result
    }

    /// Whether an endpoint is registered
    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.read().contains_key(name)
    }

    /// Registered endpoints, sorted by name
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut infos: Vec<EndpointInfo> = self
            .endpoints
            .read()
            .iter()
            .map(|(name, e)| EndpointInfo {
                name: name.clone(),
                provider: e.provider.clone(),
                registered_at: e.registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Remove every endpoint and refuse queued async callers
    pub fn clear(&self) {
        self.endpoints.write().clear();
        self.permits.close();
    }
}
