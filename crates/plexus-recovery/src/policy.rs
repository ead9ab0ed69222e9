//! Recovery policies and the executor that applies them

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::RetryPolicy;
use futures::future::BoxFuture;
use plexus_core::{PluginError, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

type FallbackFn<T> = Arc<dyn Fn(PluginError) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type DegradeFn<T> = Arc<dyn Fn(&PluginError) -> Result<T> + Send + Sync>;

/// What to do after the operation failed
pub enum RecoveryStrategy<T> {
    /// Run the operation again under a retry policy
    Retry(RetryPolicy),
    /// Obtain the result from another provider; receives the last error
    Fallback(FallbackFn<T>),
    /// Produce a quality-reduced result from the last error
    GracefulDegradation(DegradeFn<T>),
    /// Give up quietly with an empty result
    Skip,
    /// Propagate the last error
    Abort,
}

impl<T> RecoveryStrategy<T> {
    /// Fallback to an async provider
    pub fn fallback<F, Fut>(provider: F) -> Self
    where
        F: Fn(PluginError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        RecoveryStrategy::Fallback(Arc::new(move |err| Box::pin(provider(err))))
    }

    /// Degrade to a value derived from the error
    pub fn degrade<F>(degrade: F) -> Self
    where
        F: Fn(&PluginError) -> Result<T> + Send + Sync + 'static,
    {
        RecoveryStrategy::GracefulDegradation(Arc::new(degrade))
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry(_) => "retry",
            RecoveryStrategy::Fallback(_) => "fallback",
            RecoveryStrategy::GracefulDegradation(_) => "graceful_degradation",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Abort => "abort",
        }
    }
}

impl<T> Clone for RecoveryStrategy<T> {
    fn clone(&self) -> Self {
        match self {
            RecoveryStrategy::Retry(p) => RecoveryStrategy::Retry(p.clone()),
            RecoveryStrategy::Fallback(f) => RecoveryStrategy::Fallback(Arc::clone(f)),
            RecoveryStrategy::GracefulDegradation(f) => {
                RecoveryStrategy::GracefulDegradation(Arc::clone(f))
            }
            RecoveryStrategy::Skip => RecoveryStrategy::Skip,
            RecoveryStrategy::Abort => RecoveryStrategy::Abort,
        }
    }
}

impl<T> fmt::Debug for RecoveryStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::Retry(p) => f.debug_tuple("Retry").field(p).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Primary, secondary and tertiary strategies, tried in that order
pub struct RecoveryPolicy<T> {
    strategies: Vec<RecoveryStrategy<T>>,
}

impl<T> Clone for RecoveryPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            strategies: self.strategies.clone(),
        }
    }
}

impl<T> fmt::Debug for RecoveryPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.strategies).finish()
    }
}

impl<T> RecoveryPolicy<T> {
    /// Policy with a single strategy
    pub fn new(primary: RecoveryStrategy<T>) -> Self {
        Self {
            strategies: vec![primary],
        }
    }

    /// Policy that propagates the first error
    pub fn abort() -> Self {
        Self::new(RecoveryStrategy::Abort)
    }

    /// Add the secondary strategy
    pub fn then(mut self, secondary: RecoveryStrategy<T>) -> Self {
        self.push(secondary);
        self
    }

    /// Add the tertiary strategy
    pub fn finally(mut self, tertiary: RecoveryStrategy<T>) -> Self {
        self.push(tertiary);
        self
    }

    fn push(&mut self, strategy: RecoveryStrategy<T>) {
        if self.strategies.len() < 3 {
            self.strategies.push(strategy);
        } else {
            warn!(strategy = strategy.name(), "Recovery policy already has three strategies");
        }
    }

    /// Strategies in the order they are tried
    pub fn strategies(&self) -> &[RecoveryStrategy<T>] {
        &self.strategies
    }
}

/// How a recovered call produced its result
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered<T> {
    /// The operation succeeded; `attempts` counts the first call and any retries
    Completed {
        /// Result value
        value: T,
        /// Calls made
        attempts: u32,
    },
    /// A fallback provider supplied the result
    FellBack(T),
    /// A degraded result was produced
    Degraded(T),
    /// The operation was skipped
    Skipped,
}

impl<T> Recovered<T> {
    /// The value, if any
    pub fn into_value(self) -> Option<T> {
        match self {
            Recovered::Completed { value, .. }
            | Recovered::FellBack(value)
            | Recovered::Degraded(value) => Some(value),
            Recovered::Skipped => None,
        }
    }

    /// Whether the result came from the operation itself
    pub fn is_completed(&self) -> bool {
        matches!(self, Recovered::Completed { .. })
    }
}

/// Runs operations under a recovery policy, optionally behind circuit breakers
#[derive(Debug, Clone, Default)]
pub struct RecoveryExecutor {
    breaker: Option<CircuitBreaker>,
}

impl RecoveryExecutor {
    /// Executor without circuit breaking
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard every operation with `breaker`, keyed by operation name
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// The breaker guarding operations, if any
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    async fn attempt<T, F, Fut>(&self, name: &str, op: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.breaker {
            Some(breaker) => breaker.call(name, &mut *op).await,
            None => op().await,
        }
    }

    /// Run `op`, applying `policy` when it fails
    ///
    /// The operation runs once; on failure each strategy is tried in order
    /// until one produces a result. `Abort`, or running out of strategies,
    /// returns the most recent error.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        policy: &RecoveryPolicy<T>,
        mut op: F,
    ) -> Result<Recovered<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = match self.attempt(name, &mut op).await {
            Ok(value) => return Ok(Recovered::Completed { value, attempts: 1 }),
            Err(e) => e,
        };

        for strategy in policy.strategies() {
            debug!(operation = name, strategy = strategy.name(), error = %last_error, "Applying recovery strategy");
            match strategy {
                RecoveryStrategy::Retry(retry) => {
                    // The failed first call counts as attempt 1.
                    let mut attempt = 1;
                    while attempt < retry.max_attempts && retry.should_retry(&last_error) {
                        tokio::time::sleep(retry.delay_for(attempt)).await;
                        attempt += 1;
                        match self.attempt(name, &mut op).await {
                            Ok(value) => {
                                info!(operation = name, attempts = attempt, "Operation recovered by retry");
                                return Ok(Recovered::Completed {
                                    value,
                                    attempts: attempt,
                                });
                            }
                            Err(e) => last_error = e,
                        }
                    }
                }
                RecoveryStrategy::Fallback(provider) => match provider(last_error.clone()).await {
                    Ok(value) => {
                        info!(operation = name, "Operation recovered by fallback");
                        return Ok(Recovered::FellBack(value));
                    }
                    Err(e) => last_error = e,
                },
                RecoveryStrategy::GracefulDegradation(degrade) => match degrade(&last_error) {
                    Ok(value) => {
                        warn!(operation = name, error = %last_error, "Operation degraded");
                        return Ok(Recovered::Degraded(value));
                    }
                    Err(e) => last_error = e,
                },
                RecoveryStrategy::Skip => {
                    warn!(operation = name, error = %last_error, "Operation skipped");
                    return Ok(Recovered::Skipped);
                }
                RecoveryStrategy::Abort => break,
            }
        }

        warn!(operation = name, error = %last_error, "Recovery failed");
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use plexus_core::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(0.0)
    }

    #[tokio::test]
    async fn test_success_needs_no_recovery() {
        let executor = RecoveryExecutor::new();
        let out = executor
            .execute("op", &RecoveryPolicy::abort(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(out, Recovered::Completed { value: 7, attempts: 1 });
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = AtomicU32::new(0);
        let policy = RecoveryPolicy::new(RecoveryStrategy::Retry(quick_retry(4)));
        let out = RecoveryExecutor::new()
            .execute("op", &policy, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(PluginError::timeout("slow"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, Recovered::Completed { value: "done", attempts: 3 });
    }

    #[tokio::test]
    async fn test_retry_then_fallback() {
        let calls = AtomicU32::new(0);
        let policy = RecoveryPolicy::new(RecoveryStrategy::Retry(quick_retry(3)))
            .then(RecoveryStrategy::fallback(|err: PluginError| async move {
                assert_eq!(err.kind(), ErrorKind::NetworkError);
                Ok("cached".to_string())
            }));
        let out = RecoveryExecutor::new()
            .execute("op", &policy, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>(PluginError::network("down")) }
            })
            .await
            .unwrap();
        assert_eq!(out, Recovered::FellBack("cached".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_degrade_skip_and_abort() {
        let failing = || async { Err::<Vec<u32>, _>(PluginError::execution_failed("boom")) };
        let executor = RecoveryExecutor::new();

        let degraded = RecoveryPolicy::new(RecoveryStrategy::degrade(|_: &PluginError| Ok(vec![0])));
        assert_eq!(
            executor.execute("op", &degraded, failing).await.unwrap(),
            Recovered::Degraded(vec![0])
        );

        let skip = RecoveryPolicy::new(RecoveryStrategy::Abort).then(RecoveryStrategy::Skip);
        let err = executor.execute("op", &skip, failing).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);

        let skip = RecoveryPolicy::new(RecoveryStrategy::fallback(|_: PluginError| async {
            Err::<Vec<u32>, _>(PluginError::not_found("no secondary"))
        }))
        .then(RecoveryStrategy::Skip);
        let out = executor.execute("op", &skip, failing).await.unwrap();
        assert_eq!(out.into_value(), None);
    }

    #[tokio::test]
    async fn test_failing_fallback_replaces_last_error() {
        let policy = RecoveryPolicy::new(RecoveryStrategy::fallback(|_: PluginError| async {
            Err::<(), _>(PluginError::not_found("no secondary"))
        }));
        let err = RecoveryExecutor::new()
            .execute("op", &policy, || async { Err(PluginError::network("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(60),
            ..CircuitBreakerConfig::default()
        });
        let executor = RecoveryExecutor::new().with_circuit_breaker(breaker.clone());
        let calls = AtomicU32::new(0);
        let op = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(PluginError::network("down")) }
        };

        for _ in 0..2 {
            let _ = executor.execute("fetch", &RecoveryPolicy::abort(), op).await;
        }
        assert_eq!(breaker.state("fetch"), CircuitState::Open);

        let err = executor
            .execute("fetch", &RecoveryPolicy::abort(), op)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_policy_holds_three_strategies() {
        let policy: RecoveryPolicy<()> = RecoveryPolicy::new(RecoveryStrategy::Abort)
            .then(RecoveryStrategy::Skip)
            .finally(RecoveryStrategy::Abort)
            .then(RecoveryStrategy::Skip);
        assert_eq!(policy.strategies().len(), 3);
    }
}
