//! Hook types and event definitions.
//!
//! - `HookEvent`: the points around a phase transition that can run hooks
//! - `HookAction`: what a hook tells the engine to do
//! - `HookResult`: the outcome of running one or more hooks
//! - `HookContext`: the JSON document piped to a hook on stdin

use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle events that can trigger hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Before a transition is applied (can block it)
    PrePhase,
    /// After a transition has been persisted
    PostPhase,
}

impl HookEvent {
    pub fn all() -> &'static [HookEvent] {
        &[HookEvent::PrePhase, HookEvent::PostPhase]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PrePhase => "pre_phase",
            HookEvent::PostPhase => "post_phase",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pre_phase" | "prephase" => Ok(HookEvent::PrePhase),
            "post_phase" | "postphase" => Ok(HookEvent::PostPhase),
            _ => anyhow::bail!("Invalid hook event '{}'. Valid values: pre_phase, post_phase", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    #[default]
    Continue,
    Block,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub action: HookAction,
    #[serde(default)]
    pub message: Option<String>,
}

impl HookResult {
    pub fn continue_execution() -> Self {
        Self::default()
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            action: HookAction::Block,
            message: Some(reason.into()),
        }
    }

    pub fn should_continue(&self) -> bool {
        self.action == HookAction::Continue
    }
}

/// Context data passed to hooks on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub feature_id: String,
    /// Phase the hook is matched against: the source phase for `pre_phase`,
    /// the destination for `post_phase`.
    pub phase: Phase,
    pub from: Phase,
    /// Destination phase; `None` before it is known.
    #[serde(default)]
    pub to: Option<Phase>,
    #[serde(default)]
    pub workstream_id: Option<String>,
    /// Human-readable phase result.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl HookContext {
    pub fn pre_phase(
        feature_id: &str,
        from: Phase,
        workstream_id: Option<&str>,
        result: &str,
    ) -> Self {
        Self {
            event: HookEvent::PrePhase,
            feature_id: feature_id.to_string(),
            phase: from,
            from,
            to: None,
            workstream_id: workstream_id.map(str::to_string),
            result: Some(result.to_string()),
            extra: HashMap::new(),
        }
    }

    pub fn post_phase(
        feature_id: &str,
        from: Phase,
        to: Phase,
        workstream_id: Option<&str>,
        result: &str,
    ) -> Self {
        Self {
            event: HookEvent::PostPhase,
            feature_id: feature_id.to_string(),
            phase: to,
            from,
            to: Some(to),
            workstream_id: workstream_id.map(str::to_string),
            result: Some(result.to_string()),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
