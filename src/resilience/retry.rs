//! Retry with exponential backoff and jitter.
//!
//! Only errors that report themselves [`Retryable`] are retried; everything
//! else is returned on the first failure. Exhausting the attempt budget turns
//! into [`ResilienceError::RetriesExhausted`] carrying the attempt count and
//! the last error message.

use crate::errors::ResilienceError;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Classifies an error as transient (worth retrying) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total calls including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Apply ±25% random jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Delay before retry number `retry` (1-based), before jitter.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exp = retry.saturating_sub(1) as i32;
    let factor = config.multiplier.max(1.0).powi(exp);
    let millis = config.initial_delay.as_millis() as f64 * factor;
    let capped = millis.min(config.max_delay.as_millis() as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.75..=1.25);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// A cancelled token aborts immediately, including in the middle of a
/// backoff wait, with [`ResilienceError::Cancelled`].
pub async fn with_retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display + From<ResilienceError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled.into());
        }
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(ResilienceError::RetriesExhausted {
                attempts: attempt,
                last_error: err.to_string(),
            }
            .into());
        }

        let mut delay = backoff_delay(config, attempt);
        if config.jitter {
            delay = apply_jitter(delay);
        }
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(ResilienceError::Cancelled.into()),
        }
    }
}
