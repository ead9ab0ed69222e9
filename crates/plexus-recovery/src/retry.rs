//! Retry with exponential backoff and jitter

use plexus_core::{ErrorKind, PluginError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error kinds retried when a policy names none
pub const TRANSIENT_KINDS: &[ErrorKind] = &[
    ErrorKind::Timeout,
    ErrorKind::NetworkError,
    ErrorKind::ResourceUnavailable,
    ErrorKind::ResourceExhausted,
];

type Predicate = Arc<dyn Fn(&PluginError) -> bool + Send + Sync>;

/// Retry policy
///
/// `max_attempts` counts every call including the first. The delay before
/// retry `n` (1-based) is `initial_delay * multiplier^(n-1)`, capped at
/// `max_delay`, then spread by up to `jitter` of itself in either direction.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Backoff growth factor
    pub multiplier: f64,
    /// Jitter fraction (0.0 to 1.0)
    pub jitter: f64,
    /// Kinds worth retrying; empty means [`TRANSIENT_KINDS`]
    pub retry_on: Vec<ErrorKind>,
    #[serde(skip)]
    predicate: Option<Predicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
            retry_on: Vec::new(),
            predicate: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` total attempts and default backoff
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(1)
    }

    /// Set the first delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff factor
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry only these kinds
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Decide retries with a custom predicate instead of error kinds
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PluginError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Check that the policy is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PluginError::invalid_configuration(
                "max_attempts must be at least 1",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(PluginError::invalid_configuration(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(PluginError::invalid_configuration(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Whether `error` is worth another attempt
    pub fn should_retry(&self, error: &PluginError) -> bool {
        if let Some(predicate) = &self.predicate {
            return predicate(error);
        }
        if self.retry_on.is_empty() {
            TRANSIENT_KINDS.contains(&error.kind())
        } else {
            self.retry_on.contains(&error.kind())
        }
    }

    /// Backoff before retry `retry` (1-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Backoff before retry `retry` (1-based), with jitter applied
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempts are used up
    ///
    /// `op` receives the 1-based attempt number. An exhausted policy returns
    /// the last error with the retry count in its details.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_counted(op).await.map(|(value, _)| value)
    }

    /// Like [`run`](Self::run), also returning how many attempts were made
    pub async fn run_counted<T, F, Fut>(&self, mut op: F) -> Result<(T, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !self.should_retry(&e) => {
                    debug!(attempt, error = %e, "Error is not retryable");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(attempts = attempt, error = %e, "Retries exhausted");
                    let retries = attempt - 1;
                    return Err(e.with_details(format!(
                        "retries: {retries}, attempts: {attempt}"
                    )));
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_multiplier(2.0)
            .with_jitter(0.0);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(0.5);
        for _ in 0..100 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_retry_predicate_over_kinds() {
        let default = RetryPolicy::default();
        assert!(default.should_retry(&PluginError::timeout("slow")));
        assert!(!default.should_retry(&PluginError::invalid_parameters("bad")));

        let custom = RetryPolicy::default().retry_on([ErrorKind::ExecutionFailed]);
        assert!(custom.should_retry(&PluginError::execution_failed("boom")));
        assert!(!custom.should_retry(&PluginError::timeout("slow")));

        let never = RetryPolicy::default().with_predicate(|_| false);
        assert!(!never.should_retry(&PluginError::timeout("slow")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5).with_jitter(0.0);

        let (value, attempts) = policy
            .run_counted(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(PluginError::network("connection reset"))
                    } else {
                        Ok(attempt * 10)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 30);
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausted_reports_retry_count() {
        let policy = RetryPolicy::new(3).with_jitter(0.0);
        let err = policy
            .run(|_| async { Err::<(), _>(PluginError::network("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(err.details(), Some("retries: 2, attempts: 3"));
    }

    #[tokio::test]
    async fn test_run_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::new(5)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(PluginError::signature_invalid("bad signature")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deserialize_policy() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 4,
            "initial_delay": "50ms",
            "retry_on": ["network_error", "timeout"]
        }))
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.retry_on, vec![ErrorKind::NetworkError, ErrorKind::Timeout]);
        assert!(policy.validate().is_ok());
        assert!(RetryPolicy::new(0).validate().is_err());
    }
}
