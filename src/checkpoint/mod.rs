//! Durable per-feature progress.
//!
//! One JSON file per feature under the checkpoints directory. The file is
//! only ever replaced atomically, so concurrent agents working on the same
//! feature never observe a half-written checkpoint.

pub mod runs;
pub mod store;

pub use runs::{RunMarker, RunsDir};
pub use store::CheckpointStore;

use crate::errors::{CheckpointError, PhaseError};
use crate::phase::{Phase, PhaseResult};
use crate::workstream::Workstream;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Current on-disk schema. Files with a higher version are refused.
pub const SCHEMA_VERSION: u32 = 1;

static FEATURE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(F\d{2,4}|\d{2}-\d{3})$").unwrap());

/// Reject anything that is not a safe, well-formed feature id.
///
/// This runs before any path is built from the id.
pub fn validate_feature_id(id: &str) -> Result<(), CheckpointError> {
    let traversal = id.contains("..")
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');
    if traversal || !FEATURE_ID.is_match(id) {
        return Err(CheckpointError::InvalidFeatureId(id.to_string()));
    }
    Ok(())
}

/// Workstream id prefix for a feature: `F016` -> `00-016-`, `01-042` -> `01-042-`.
pub fn workstream_prefix(feature_id: &str) -> String {
    match feature_id.strip_prefix('F') {
        Some(digits) => {
            let n: u32 = digits.parse().unwrap_or(0);
            format!("{:02}-{:03}-", n / 1000, n % 1000)
        }
        None => format!("{}-", feature_id),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkstreamStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkstreamEntry {
    pub id: String,
    pub status: WorkstreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkstreamEntry {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: WorkstreamStatus::Pending,
            commit: None,
            completed_at: None,
        }
    }
}

/// One applied phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub result: PhaseResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstream: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub feature_id: String,
    pub branch: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub workstreams: Vec<WorkstreamEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_workstream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Checkpoint {
    /// Fresh checkpoint for a feature: first actionable phase, every
    /// discovered workstream pending.
    pub fn create_initial(feature_id: &str, branch: &str, workstreams: &[Workstream]) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            feature_id: feature_id.to_string(),
            branch: branch.to_string(),
            phase: Phase::Build,
            created_at: Utc::now(),
            workstreams: workstreams
                .iter()
                .map(|ws| WorkstreamEntry::pending(ws.id.clone()))
                .collect(),
            current_workstream: None,
            pr_number: None,
            history: Vec::new(),
        }
    }

    pub fn entry(&self, ws_id: &str) -> Option<&WorkstreamEntry> {
        self.workstreams.iter().find(|w| w.id == ws_id)
    }

    pub fn is_completed(&self, ws_id: &str) -> bool {
        self.entry(ws_id)
            .is_some_and(|w| w.status == WorkstreamStatus::Completed)
    }

    /// Live pending set: discovered workstreams not completed on disk and
    /// not completed here, in discovery order.
    pub fn pending<'a>(&self, discovered: &'a [Workstream]) -> Vec<&'a Workstream> {
        discovered
            .iter()
            .filter(|ws| !ws.completed && !self.is_completed(&ws.id))
            .collect()
    }

    /// Record `ws_id` as built by `commit`. Unknown ids are appended.
    pub fn mark_completed(&mut self, ws_id: &str, commit: &str) {
        let now = Utc::now();
        match self.workstreams.iter_mut().find(|w| w.id == ws_id) {
            Some(entry) => {
                entry.status = WorkstreamStatus::Completed;
                entry.commit = Some(commit.to_string());
                entry.completed_at = Some(now);
            }
            None => self.workstreams.push(WorkstreamEntry {
                id: ws_id.to_string(),
                status: WorkstreamStatus::Completed,
                commit: Some(commit.to_string()),
                completed_at: Some(now),
            }),
        }
    }

    /// Prerequisites of `ws` that are still pending. Ids outside the
    /// discovered set belong to other features and are not checked.
    pub fn unmet_dependencies(&self, ws: &Workstream, discovered: &[Workstream]) -> Vec<String> {
        let pending = self.pending(discovered);
        ws.depends_on
            .iter()
            .filter(|dep| pending.iter().any(|p| &p.id == *dep))
            .cloned()
            .collect()
    }

    /// Pending workstreams whose prerequisites are all complete.
    pub fn ready<'a>(&self, discovered: &'a [Workstream]) -> Vec<&'a Workstream> {
        self.pending(discovered)
            .into_iter()
            .filter(|ws| self.unmet_dependencies(ws, discovered).is_empty())
            .collect()
    }

    /// The workstream to build next: the pinned one while it is pending,
    /// else the first ready one. When every pending workstream is waiting
    /// on another, the first pending one is returned so the caller can
    /// report what blocks it.
    pub fn next_workstream<'a>(&self, discovered: &'a [Workstream]) -> Option<&'a Workstream> {
        let pending = self.pending(discovered);
        if let Some(current) = self.current_workstream.as_deref()
            && let Some(ws) = pending.iter().find(|ws| ws.id == current)
        {
            return Some(*ws);
        }
        self.ready(discovered)
            .first()
            .copied()
            .or_else(|| pending.first().copied())
    }

    /// Refuse to work on `ws_id` while one of its prerequisites is pending.
    pub fn check_dependencies(&self, ws_id: &str, discovered: &[Workstream]) -> Result<(), PhaseError> {
        let Some(ws) = discovered.iter().find(|w| w.id == ws_id) else {
            return Ok(());
        };
        let unmet = self.unmet_dependencies(ws, discovered);
        if unmet.is_empty() {
            return Ok(());
        }
        Err(PhaseError::Blocked {
            phase: self.phase,
            blocker: format!("workstream {} depends on {}", ws_id, unmet.join(", ")),
        })
    }

    /// Mark `ws_id` as the workstream being built right now.
    pub fn start_workstream(&mut self, ws_id: &str, discovered: &[Workstream]) -> Result<(), PhaseError> {
        self.check_dependencies(ws_id, discovered)?;
        if self.entry(ws_id).is_none() {
            self.workstreams.push(WorkstreamEntry::pending(ws_id));
        }
        for entry in self.workstreams.iter_mut() {
            if entry.status == WorkstreamStatus::InProgress && entry.id != ws_id {
                entry.status = WorkstreamStatus::Pending;
            }
            if entry.id == ws_id && entry.status != WorkstreamStatus::Completed {
                entry.status = WorkstreamStatus::InProgress;
            }
        }
        self.current_workstream = Some(ws_id.to_string());
        Ok(())
    }

    /// Fold live discovery into the checkpoint: append workstreams added
    /// since creation and drop a `current_workstream` that no longer exists.
    /// Returns `true` if anything changed.
    pub fn reconcile(&mut self, discovered: &[Workstream]) -> bool {
        let mut changed = false;
        for ws in discovered {
            if self.entry(&ws.id).is_none() {
                tracing::info!(ws_id = %ws.id, "picked up new workstream");
                self.workstreams.push(WorkstreamEntry::pending(ws.id.clone()));
                changed = true;
            }
        }
        if let Some(current) = &self.current_workstream
            && !discovered.iter().any(|ws| &ws.id == current)
        {
            tracing::warn!(ws_id = %current, "current workstream no longer discovered; clearing");
            self.current_workstream = None;
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_feature_ids() {
        for id in ["F01", "F016", "F1234", "00-016", "12-345"] {
            assert!(validate_feature_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_traversal_and_malformed_ids_rejected() {
        for id in [
            "", "F1", "F12345", "f016", "../F016", "F016/..", "F0\\16", "F016\0", "..", "F016.json",
            "00-16", "feature",
        ] {
            assert!(
                matches!(validate_feature_id(id), Err(CheckpointError::InvalidFeatureId(_))),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_workstream_prefix() {
        assert_eq!(workstream_prefix("F016"), "00-016-");
        assert_eq!(workstream_prefix("F1042"), "01-042-");
        assert_eq!(workstream_prefix("02-100"), "02-100-");
    }

    #[test]
    fn test_create_initial_marks_everything_pending() {
        let ws = vec![Workstream::pending("00-016-01"), Workstream::pending("00-016-02")];
        let cp = Checkpoint::create_initial("F016", "feature/F016", &ws);
        assert_eq!(cp.phase, Phase::Build);
        assert_eq!(cp.schema_version, SCHEMA_VERSION);
        assert!(cp
            .workstreams
            .iter()
            .all(|w| w.status == WorkstreamStatus::Pending));
        assert_eq!(cp.pending(&ws).len(), 2);
    }

    #[test]
    fn test_pending_uses_live_discovery() {
        let mut ws = vec![Workstream::pending("00-016-01")];
        let mut cp = Checkpoint::create_initial("F016", "main", &ws);
        cp.mark_completed("00-016-01", "abc1234");

        ws.push(Workstream::pending("00-016-02"));
        let pending: Vec<_> = cp.pending(&ws).iter().map(|w| w.id.clone()).collect();
        assert_eq!(pending, vec!["00-016-02"]);

        let mut done_on_disk = Workstream::pending("00-016-03");
        done_on_disk.completed = true;
        ws.push(done_on_disk);
        assert_eq!(cp.pending(&ws).len(), 1);
    }

    #[test]
    fn test_reconcile_appends_and_clears_stale_current() {
        let ws = vec![Workstream::pending("00-016-01")];
        let mut cp = Checkpoint::create_initial("F016", "main", &ws);
        cp.current_workstream = Some("00-016-09".into());

        let grown = vec![Workstream::pending("00-016-01"), Workstream::pending("00-016-02")];
        assert!(cp.reconcile(&grown));
        assert_eq!(cp.workstreams.len(), 2);
        assert!(cp.current_workstream.is_none());
        assert!(!cp.reconcile(&grown));
    }

    #[test]
    fn test_start_workstream_moves_in_progress_marker() {
        let ws = vec![Workstream::pending("00-016-01"), Workstream::pending("00-016-02")];
        let mut cp = Checkpoint::create_initial("F016", "main", &ws);
        cp.start_workstream("00-016-01", &ws).unwrap();
        cp.start_workstream("00-016-02", &ws).unwrap();
        assert_eq!(cp.entry("00-016-01").unwrap().status, WorkstreamStatus::Pending);
        assert_eq!(cp.entry("00-016-02").unwrap().status, WorkstreamStatus::InProgress);
        assert_eq!(cp.current_workstream.as_deref(), Some("00-016-02"));
    }

    fn with_dependency() -> Vec<Workstream> {
        let mut second = Workstream::pending("00-016-02");
        second.depends_on = vec!["00-016-01".into()];
        vec![second, Workstream::pending("00-016-01")]
    }

    #[test]
    fn test_ready_skips_workstreams_with_pending_prerequisites() {
        let ws = with_dependency();
        let mut cp = Checkpoint::create_initial("F016", "main", &ws);
        let ready: Vec<_> = cp.ready(&ws).iter().map(|w| w.id.clone()).collect();
        assert_eq!(ready, vec!["00-016-01"]);
        assert_eq!(cp.next_workstream(&ws).unwrap().id, "00-016-01");

        cp.mark_completed("00-016-01", "abc1234");
        assert_eq!(cp.next_workstream(&ws).unwrap().id, "00-016-02");
        assert!(cp.unmet_dependencies(&ws[0], &ws).is_empty());
    }

    #[test]
    fn test_start_workstream_blocked_by_prerequisite() {
        let ws = with_dependency();
        let mut cp = Checkpoint::create_initial("F016", "main", &ws);
        let err = cp.start_workstream("00-016-02", &ws).unwrap_err();
        match err {
            PhaseError::Blocked { blocker, .. } => {
                assert!(blocker.contains("depends on 00-016-01"), "{blocker}")
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
        assert!(cp.current_workstream.is_none());
        assert_eq!(cp.entry("00-016-02").unwrap().status, WorkstreamStatus::Pending);
    }

    #[test]
    fn test_dependency_outside_feature_is_not_checked() {
        let mut ws = Workstream::pending("00-016-01");
        ws.depends_on = vec!["00-015-03".into()];
        let discovered = vec![ws];
        let mut cp = Checkpoint::create_initial("F016", "main", &discovered);
        assert!(cp.start_workstream("00-016-01", &discovered).is_ok());
    }

    #[test]
    fn test_dependency_cycle_still_names_a_workstream() {
        let mut a = Workstream::pending("00-016-01");
        a.depends_on = vec!["00-016-02".into()];
        let mut b = Workstream::pending("00-016-02");
        b.depends_on = vec!["00-016-01".into()];
        let ws = vec![a, b];
        let cp = Checkpoint::create_initial("F016", "main", &ws);
        assert!(cp.ready(&ws).is_empty());
        assert_eq!(cp.next_workstream(&ws).unwrap().id, "00-016-01");
        assert!(cp.check_dependencies("00-016-01", &ws).is_err());
    }

    #[test]
    fn test_unknown_phase_rejected_at_load() {
        let json = r#"{"schema_version":1,"feature_id":"F016","branch":"main",
            "phase":"deploying","created_at":"2026-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<Checkpoint>(json).is_err());
    }
}
