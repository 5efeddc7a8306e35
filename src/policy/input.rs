//! Building [`PolicyInput`] from observed facts.

use super::PolicyInput;
use crate::phase::Phase;
use crate::workstream::Workstream;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const EVIDENCE_DIR: &str = ".sdp/evidence";
const WORKSTREAM_DOCS: &str = "docs/workstreams/";
const DOCS: &str = "docs/";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Findings {
    #[serde(default)]
    pub p0: u32,
    #[serde(default)]
    pub p1: u32,
    #[serde(default)]
    pub p2: u32,
}

/// Contents of `.sdp/evidence/<FEATURE>.json`. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub findings: Findings,
    #[serde(default)]
    pub review_approved: bool,
}

pub fn evidence_path(evidence_dir: &Path, feature_id: &str) -> PathBuf {
    evidence_dir.join(format!("{}.json", feature_id))
}

/// Read the evidence file. A missing file is `None`; an unparseable one is
/// present but empty.
pub fn read_evidence(evidence_dir: &Path, feature_id: &str) -> Option<Evidence> {
    let path = evidence_path(evidence_dir, feature_id);
    let content = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(evidence) => Some(evidence),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "evidence file unreadable; treating as empty");
            Some(Evidence::default())
        }
    }
}

fn is_implementation_file(path: &str) -> bool {
    !path.starts_with(DOCS) && !path.starts_with(".sdp/")
}

/// Implementation files changed outside the workstream's declared scope.
/// A workstream without scope globs has no boundary to violate.
pub fn scope_violations(changed_files: &[String], workstream: Option<&Workstream>) -> Vec<String> {
    let Some(ws) = workstream else {
        return Vec::new();
    };
    let patterns: Vec<glob::Pattern> = ws
        .scope
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(ws_id = %ws.id, pattern = %p, error = %e, "ignoring invalid scope glob");
                None
            }
        })
        .collect();
    if patterns.is_empty() {
        return Vec::new();
    }
    changed_files
        .iter()
        .filter(|f| is_implementation_file(f))
        .filter(|f| !patterns.iter().any(|p| p.matches(f)))
        .cloned()
        .collect()
}

/// Snapshot the facts a policy may look at.
pub fn build_policy_input(
    evidence_dir: &Path,
    phase: Phase,
    feature_id: &str,
    workstream: Option<&Workstream>,
    branch: &str,
    changed_files: Vec<String>,
) -> PolicyInput {
    let evidence = read_evidence(evidence_dir, feature_id);
    let findings = evidence.as_ref().map(|e| e.findings).unwrap_or_default();
    let violations = scope_violations(&changed_files, workstream);

    PolicyInput {
        phase,
        feature_id: feature_id.to_string(),
        workstream_id: workstream.map(|w| w.id.clone()),
        branch: branch.to_string(),
        has_workstream_changes: changed_files.iter().any(|f| f.starts_with(WORKSTREAM_DOCS)),
        has_feature_changes: changed_files.iter().any(|f| is_implementation_file(f)),
        scope_violations: violations.len(),
        evidence_present: evidence.is_some(),
        findings_p0: findings.p0,
        findings_p1: findings.p1,
        findings_p2: findings.p2,
        changed_files,
    }
}
