//! Policy bridge.
//!
//! Turns observed facts into a [`PolicyInput`], asks an external evaluator
//! for the enforcement level, denials and warnings, and hands back a
//! [`PolicyResult`]. Policy is opt-in: with no policy directory or no
//! evaluator binary the result is empty and advisory, never an error.

pub mod evaluator;
pub mod input;

pub use evaluator::{FakeEvaluator, OpaEvaluator, PolicyEvaluator, PolicyQuery};
pub use input::{EVIDENCE_DIR, Evidence, Findings, build_policy_input, read_evidence};

use crate::errors::ExternalError;
use crate::phase::Phase;
use crate::resilience::Guard;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const POLICY_DIR: &str = ".sdp/policies";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInput {
    pub phase: Phase,
    pub feature_id: String,
    pub workstream_id: Option<String>,
    pub branch: String,
    pub changed_files: Vec<String>,
    pub scope_violations: usize,
    pub evidence_present: bool,
    pub has_workstream_changes: bool,
    pub has_feature_changes: bool,
    pub findings_p0: u32,
    pub findings_p1: u32,
    pub findings_p2: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    #[default]
    Advisory,
    Blocking,
}

impl EnforcementLevel {
    /// Anything but `blocking` is advisory.
    fn from_value(value: &serde_json::Value) -> Self {
        match value.as_str().map(|s| s.trim().to_lowercase()).as_deref() {
            Some("blocking") => EnforcementLevel::Blocking,
            _ => EnforcementLevel::Advisory,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub denials: Vec<String>,
    pub warnings: Vec<String>,
    pub level: EnforcementLevel,
}

impl PolicyResult {
    /// Whether this verdict must stop a transition.
    pub fn blocks(&self) -> bool {
        self.level == EnforcementLevel::Blocking && !self.denials.is_empty()
    }
}

/// A rule value as a list of messages. OPA sets come back as arrays; a lone
/// string is one message; anything else is nothing.
fn string_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => {
            let mut out: Vec<String> = items
                .iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect();
            out.sort();
            out.dedup();
            out
        }
        serde_json::Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Evaluate the policies under `policy_dir` against `input`.
///
/// Each of the three queries runs through `guard`; one failing query only
/// empties its own field.
pub async fn evaluate_policies(
    policy_dir: &Path,
    input: &PolicyInput,
    evaluator: &dyn PolicyEvaluator,
    guard: &Guard<'_>,
) -> PolicyResult {
    if !policy_dir.is_dir() {
        tracing::debug!(dir = %policy_dir.display(), "no policy directory; skipping evaluation");
        return PolicyResult::default();
    }
    if !evaluator.is_available() {
        tracing::debug!("policy evaluator not installed; skipping evaluation");
        return PolicyResult::default();
    }

    let input_json = match serde_json::to_value(input) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "could not serialize policy input");
            return PolicyResult::default();
        }
    };

    let mut result = PolicyResult::default();
    for query in PolicyQuery::all() {
        let value = guard
            .call(|| evaluator.query(policy_dir, query, &input_json))
            .await;
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                log_query_failure(query, &e);
                continue;
            }
        };
        match query {
            PolicyQuery::EnforcementLevel => result.level = EnforcementLevel::from_value(&value),
            PolicyQuery::Deny => result.denials = string_list(&value),
            PolicyQuery::Warn => result.warnings = string_list(&value),
        }
    }

    tracing::debug!(
        level = ?result.level,
        denials = result.denials.len(),
        warnings = result.warnings.len(),
        "policy evaluated"
    );
    result
}

fn log_query_failure(query: PolicyQuery, err: &ExternalError) {
    tracing::warn!(query = ?query, error = %err, "policy query failed; treating as empty");
}
