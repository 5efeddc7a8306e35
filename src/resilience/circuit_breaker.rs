//! Circuit breaker guarding a single external dependency.
//!
//! ```text
//!   closed --(failures >= failure_threshold)--> open
//!   open --(timeout elapsed, next call)--> half-open (one probe in flight)
//!   half-open --(successes >= success_threshold)--> closed
//!   half-open --(any failure)--> open
//! ```

use crate::errors::ResilienceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Thread-safe circuit breaker. Share it behind `Arc` or by reference.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

enum Admission {
    Normal,
    Probe,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave counters half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout: self.config.timeout,
            opened_at: inner.opened_at,
        }
    }

    fn admit(&self) -> Result<Admission, ResilienceError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed < self.config.timeout {
                    return Err(ResilienceError::CircuitOpen {
                        name: self.name.clone(),
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.probe_in_flight = true;
                tracing::info!(circuit = %self.name, "circuit half-open, probing");
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(ResilienceError::CircuitOpen {
                        name: self.name.clone(),
                    });
                }
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Normal => {
                if inner.state == CircuitState::Closed {
                    inner.failure_count = 0;
                }
            }
            Admission::Probe => {
                inner.probe_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    tracing::info!(circuit = %self.name, "circuit closed");
                }
            }
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Normal => {
                if inner.state != CircuitState::Closed {
                    return;
                }
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            Admission::Probe => {
                inner.probe_in_flight = false;
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(circuit = %self.name, "probe failed, circuit reopened");
            }
        }
    }

    fn on_cancel(&self, admission: Admission) {
        if let Admission::Probe = admission {
            self.lock().probe_in_flight = false;
        }
    }

    /// Run `op` through the breaker.
    ///
    /// While open (and before the timeout has elapsed) the call is rejected
    /// with [`ResilienceError::CircuitOpen`] and `op` is never invoked.
    /// Cancellation while `op` is running does not count as a failure.
    pub async fn execute<T, E, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled.into());
        }
        let admission = self.admit().map_err(E::from)?;

        let outcome = tokio::select! {
            res = op() => Some(res),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(Ok(value)) => {
                self.on_success(admission);
                Ok(value)
            }
            Some(Err(err)) => {
                self.on_failure(admission);
                Err(err)
            }
            None => {
                self.on_cancel(admission);
                Err(ResilienceError::Cancelled.into())
            }
        }
    }
}
