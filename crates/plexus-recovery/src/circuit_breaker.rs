//! Circuit breaker keyed by operation name
//!
//! Each operation gets its own three-state breaker. Closed lets calls through
//! and counts outcomes; the breaker opens when either the consecutive failure
//! count reaches `failure_threshold` or the failure rate over at least
//! `min_requests` calls reaches `failure_rate_threshold`. After `open_timeout`
//! a limited number of probe calls are let through (half-open); enough probe
//! successes close the breaker again, any probe failure reopens it.
//!
//! Only errors of [`Severity::Error`] or worse count as failures. Caller
//! mistakes such as `InvalidParameters` say nothing about the health of the
//! operation.

use dashmap::DashMap;
use parking_lot::Mutex;
use plexus_core::{ErrorKind, PluginError, Result, Severity};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls fail immediately
    Open,
    /// A limited number of probe calls are allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit; 0 disables the count rule
    pub failure_threshold: u32,
    /// Failure rate (0.0 to 1.0) that opens the circuit
    pub failure_rate_threshold: f64,
    /// Calls observed before the rate rule applies
    pub min_requests: u64,
    /// Time spent open before probing
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Probe calls allowed while half-open
    pub half_open_max_requests: u32,
    /// Probe successes needed to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_requests: 10,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(PluginError::invalid_configuration(format!(
                "failure_rate_threshold must be within 0.0..=1.0, got {}",
                self.failure_rate_threshold
            )));
        }
        if self.half_open_max_requests == 0 {
            return Err(PluginError::invalid_configuration(
                "half_open_max_requests must be at least 1",
            ));
        }
        if self.success_threshold == 0 || self.success_threshold > self.half_open_max_requests {
            return Err(PluginError::invalid_configuration(
                "success_threshold must be within 1..=half_open_max_requests",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker counters for one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Successful calls since the last reset
    pub success_count: u64,
    /// Failed calls since the last reset
    pub failure_count: u64,
    /// All recorded calls since the last reset
    pub total_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Calls refused while open
    pub rejected_count: u64,
    /// Failure rate (0.0 to 1.0)
    pub failure_rate: f64,
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    rejected: u64,
    half_open_permits: u32,
    half_open_successes: u32,
    changed_at: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            rejected: 0,
            half_open_permits: 0,
            half_open_successes: 0,
            changed_at: Instant::now(),
        }
    }

    fn total(&self) -> u64 {
        self.successes + self.failures
    }

    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.changed_at = Instant::now();
        self.successes = 0;
        self.failures = 0;
        self.consecutive_failures = 0;
        self.half_open_permits = 0;
        self.half_open_successes = 0;
    }
}

/// Breaker for a single operation; all state sits behind one mutex
#[derive(Debug)]
struct OperationBreaker {
    name: String,
    config: CircuitBreakerConfig,
    counters: Mutex<Counters>,
}

impl OperationBreaker {
    fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            counters: Mutex::new(Counters::new()),
        }
    }

    fn state(&self) -> CircuitState {
        self.counters.lock().state
    }

    fn allow_request(&self) -> bool {
        let mut c = self.counters.lock();
        match c.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if c.changed_at.elapsed() >= self.config.open_timeout {
                    c.enter(CircuitState::HalfOpen);
                    c.half_open_permits = 1;
                    info!(operation = %self.name, "Circuit breaker transitioned to HALF-OPEN");
                    true
                } else {
                    c.rejected += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if c.half_open_permits < self.config.half_open_max_requests {
                    c.half_open_permits += 1;
                    true
                } else {
                    c.rejected += 1;
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut c = self.counters.lock();
        c.successes += 1;
        c.consecutive_failures = 0;
        if c.state == CircuitState::HalfOpen {
            c.half_open_successes += 1;
            if c.half_open_successes >= self.config.success_threshold {
                c.enter(CircuitState::Closed);
                info!(operation = %self.name, "Circuit breaker transitioned to CLOSED");
                return;
            }
        }
        debug!(
            operation = %self.name,
            state = %c.state,
            success = c.successes,
            total = c.total(),
            "Circuit breaker recorded success"
        );
    }

    fn record_failure(&self) {
        let mut c = self.counters.lock();
        c.failures += 1;
        c.consecutive_failures = c.consecutive_failures.saturating_add(1);

        let trip = match c.state {
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
            CircuitState::Closed => {
                let by_count = self.config.failure_threshold > 0
                    && c.consecutive_failures >= self.config.failure_threshold;
                let total = c.total();
                let by_rate = total >= self.config.min_requests
                    && c.failures as f64 / total as f64 >= self.config.failure_rate_threshold;
                by_count || by_rate
            }
        };

        warn!(
            operation = %self.name,
            state = %c.state,
            failures = c.failures,
            consecutive = c.consecutive_failures,
            total = c.total(),
            "Circuit breaker recorded failure"
        );

        if trip {
            c.enter(CircuitState::Open);
            warn!(operation = %self.name, "Circuit breaker transitioned to OPEN");
        }
    }

    fn reset(&self) {
        let mut c = self.counters.lock();
        c.enter(CircuitState::Closed);
        c.rejected = 0;
        info!(operation = %self.name, "Circuit breaker reset");
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let c = self.counters.lock();
        let total = c.total();
        CircuitBreakerMetrics {
            state: c.state,
            success_count: c.successes,
            failure_count: c.failures,
            total_count: total,
            consecutive_failures: c.consecutive_failures,
            rejected_count: c.rejected,
            failure_rate: if total > 0 {
                c.failures as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Whether an error should count against a breaker
///
/// A lookup miss only counts when it carries the failure that caused it as
/// context, such as every repository being unreachable.
pub fn trips_breaker(error: &PluginError) -> bool {
    match error.kind() {
        ErrorKind::PluginNotFound | ErrorKind::NotFound => error.context().is_some(),
        _ => error.severity() >= Severity::Error,
    }
}

/// Circuit breakers for any number of named operations
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    breakers: Arc<DashMap<String, Arc<OperationBreaker>>>,
}

impl CircuitBreaker {
    /// Create a breaker set sharing one configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    /// Create with default configuration
    pub fn default_config() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Configuration shared by every operation
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn get_or_create(&self, operation: &str) -> Arc<OperationBreaker> {
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(OperationBreaker::new(operation, self.config.clone())))
            .clone()
    }

    /// Check whether a call to `operation` may proceed; consumes a probe
    /// permit while half-open
    pub fn allow_request(&self, operation: &str) -> bool {
        self.get_or_create(operation).allow_request()
    }

    /// Record a successful call
    pub fn record_success(&self, operation: &str) {
        self.get_or_create(operation).record_success();
    }

    /// Record a failed call
    pub fn record_failure(&self, operation: &str) {
        self.get_or_create(operation).record_failure();
    }

    /// State of an operation's breaker; unknown operations are closed
    pub fn state(&self, operation: &str) -> CircuitState {
        self.breakers
            .get(operation)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Counters for an operation
    pub fn metrics(&self, operation: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(operation).map(|b| b.metrics())
    }

    /// Counters for every known operation
    pub fn all_metrics(&self) -> Vec<(String, CircuitBreakerMetrics)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Reset one operation's breaker
    pub fn reset(&self, operation: &str) {
        if let Some(breaker) = self.breakers.get(operation) {
            breaker.reset();
        }
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        info!("All circuit breakers reset");
    }

    /// Run `call` through the breaker for `operation`
    ///
    /// While the breaker is open the call is not started and an
    /// `ExecutionFailed` error is returned immediately.
    pub async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get_or_create(operation);
        if !breaker.allow_request() {
            return Err(PluginError::execution_failed(format!(
                "Circuit breaker is open for operation '{operation}'"
            ))
            .with_details(format!("state: {}", breaker.state())));
        }
        let result = call().await;
        match &result {
            Err(e) if trips_breaker(e) => breaker.record_failure(),
            _ => breaker.record_success(),
        }
        result
    }
}
