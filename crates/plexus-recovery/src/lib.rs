//! # Plexus Recovery
//!
//! Error recovery building blocks for the Plexus host.
//!
//! ## Features
//!
//! - **Retry**: exponential backoff with jitter and a predicate over error kinds
//! - **Circuit Breaker**: per-operation Closed / Open / HalfOpen guard
//! - **Recovery Policies**: primary, secondary and tertiary strategies
//!   (retry, fallback, graceful degradation, skip, abort)
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_recovery::prelude::*;
//! use std::time::Duration;
//!
//! # async fn fetch_catalog() -> Result<Vec<String>> { Ok(vec![]) }
//! # async fn example() -> Result<()> {
//! let policy = RecoveryPolicy::new(RecoveryStrategy::Retry(
//!     RetryPolicy::new(3).with_initial_delay(Duration::from_millis(100)),
//! ))
//! .then(RecoveryStrategy::fallback(|_err| async { Ok(Vec::new()) }));
//!
//! let executor = RecoveryExecutor::new().with_circuit_breaker(CircuitBreaker::default_config());
//! let catalog = executor
//!     .execute("catalog", &policy, fetch_catalog)
//!     .await?
//!     .into_value()
//!     .unwrap_or_default();
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

pub mod circuit_breaker;
pub mod policy;
pub mod retry;

pub use circuit_breaker::{
    trips_breaker, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use policy::{Recovered, RecoveryExecutor, RecoveryPolicy, RecoveryStrategy};
pub use retry::{RetryPolicy, TRANSIENT_KINDS};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use crate::policy::{Recovered, RecoveryExecutor, RecoveryPolicy, RecoveryStrategy};
    pub use crate::retry::RetryPolicy;
    pub use plexus_core::{PluginError, Result};
}
