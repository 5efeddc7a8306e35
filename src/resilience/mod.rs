//! Resilience toolkit for calls to external tools.
//!
//! - [`CircuitBreaker`]: fast-fails calls to a dependency that keeps failing
//! - [`with_retry`]: exponential backoff with jitter for retryable errors
//! - [`DegradedMode`]: explicit fallback posture plus a last-known-good cache
//!
//! Instances are constructed once per dependency and passed by reference;
//! there are no process-wide singletons. Every wait is bound to a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) so an interrupt
//! aborts the whole chain.

pub mod circuit_breaker;
pub mod degraded;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use degraded::{DegradedMode, DegradedStatus, with_degraded_mode};
pub use retry::{RetryConfig, Retryable, backoff_delay, with_retry};

use crate::errors::{ExternalError, ResilienceError};
use std::fmt::Display;
use std::future::Future;
use tokio_util::sync::CancellationToken;

impl Retryable for ExternalError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExternalError::Timeout { .. } | ExternalError::Unavailable { .. }
        )
    }
}

impl Retryable for ResilienceError {
    fn is_retryable(&self) -> bool {
        false
    }
}

/// The breakers owned by one engine, one per external dependency.
pub struct Breakers {
    pub git: CircuitBreaker,
    pub github: CircuitBreaker,
    pub policy: CircuitBreaker,
    pub agent: CircuitBreaker,
}

impl Breakers {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            git: CircuitBreaker::new("git", config.clone()),
            github: CircuitBreaker::new("github", config.clone()),
            policy: CircuitBreaker::new("policy", config.clone()),
            agent: CircuitBreaker::new("agent", config.clone()),
        }
    }
}

/// One dependency's breaker and retry policy, bound to a cancellation token.
///
/// The whole retry chain runs inside the breaker, so a call that exhausts
/// its retries counts as a single breaker failure.
#[derive(Clone, Copy)]
pub struct Guard<'a> {
    pub breaker: &'a CircuitBreaker,
    pub retry: &'a RetryConfig,
    pub cancel: &'a CancellationToken,
}

impl<'a> Guard<'a> {
    pub fn new(
        breaker: &'a CircuitBreaker,
        retry: &'a RetryConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            breaker,
            retry,
            cancel,
        }
    }

    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display + From<ResilienceError>,
    {
        let (cancel, retry) = (self.cancel, self.retry);
        self.breaker
            .execute(cancel, move || with_retry(cancel, retry, op))
            .await
    }
}
