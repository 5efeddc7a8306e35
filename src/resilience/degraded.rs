//! Degraded-mode toggle and last-known-good cache.
//!
//! Degraded mode is entered explicitly by a caller that has confirmed a
//! dependency is down; a single failure never flips it.

use crate::errors::ResilienceError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedStatus {
    pub active: bool,
    pub reason: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    active: bool,
    reason: Option<String>,
    since: Option<DateTime<Utc>>,
    cache: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct DegradedMode {
    state: RwLock<State>,
}

impl DegradedMode {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter degraded mode. Returns `false` if already active, in which case
    /// the original reason and timestamp are kept.
    pub fn enter(&self, reason: impl Into<String>) -> bool {
        let mut state = self.write();
        if state.active {
            return false;
        }
        let reason = reason.into();
        tracing::warn!(reason = %reason, "entering degraded mode");
        state.active = true;
        state.reason = Some(reason);
        state.since = Some(Utc::now());
        true
    }

    /// Leave degraded mode. The cache is kept.
    pub fn exit(&self) {
        let mut state = self.write();
        if state.active {
            tracing::info!("leaving degraded mode");
        }
        state.active = false;
        state.reason = None;
        state.since = None;
    }

    pub fn is_active(&self) -> bool {
        self.read().active
    }

    pub fn status(&self) -> DegradedStatus {
        let state = self.read();
        DegradedStatus {
            active: state.active,
            reason: state.reason.clone(),
            since: state.since,
        }
    }

    pub fn cache_put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.write().cache.insert(key.into(), value);
    }

    pub fn cache_get(&self, key: &str) -> Option<serde_json::Value> {
        self.read().cache.get(key).cloned()
    }
}

/// Call `primary` unless degraded mode is active, in which case `primary` is
/// skipped and `fallback` serves the result.
///
/// When `primary` fails outside degraded mode, `fallback` is tried once; if
/// it fails too the primary error is returned. The mode itself is never
/// changed here.
pub async fn with_degraded_mode<T, E, P, PF, B, BF>(
    cancel: &CancellationToken,
    mode: &DegradedMode,
    primary: P,
    fallback: B,
) -> Result<T, E>
where
    P: FnOnce() -> PF,
    PF: Future<Output = Result<T, E>>,
    B: FnOnce() -> BF,
    BF: Future<Output = Result<T, E>>,
    E: From<ResilienceError> + std::fmt::Display,
{
    if cancel.is_cancelled() {
        return Err(ResilienceError::Cancelled.into());
    }
    if mode.is_active() {
        tracing::debug!("degraded mode active, serving fallback");
        return fallback().await;
    }
    match primary().await {
        Ok(value) => Ok(value),
        Err(primary_err) => {
            tracing::warn!(error = %primary_err, "primary failed, trying fallback");
            fallback().await.map_err(|_| primary_err)
        }
    }
}
