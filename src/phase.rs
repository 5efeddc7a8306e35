//! Phase state machine.
//!
//! Phases form a small directed graph rather than a line: review can send
//! work back to build, and a failed CI loop returns to build as well. A
//! workstream that shows up after build finished reopens build from
//! review, pr or ci-loop.
//!
//! ```text
//! init -> build -> review -> pr -> ci-loop -> done
//!          ^  |      |       |        |
//!          +--+------+-------+--------+
//! ```

use crate::checkpoint::{Checkpoint, TransitionRecord, WorkstreamStatus};
use crate::errors::PhaseError;
use crate::workstream::Workstream;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static COMMIT_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{7,40}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    Build,
    Review,
    Pr,
    CiLoop,
    Done,
}

/// Every legal edge. Anything not listed here is rejected.
pub const TRANSITIONS: &[(Phase, Phase)] = &[
    (Phase::Init, Phase::Build),
    (Phase::Build, Phase::Build),
    (Phase::Build, Phase::Review),
    (Phase::Review, Phase::Pr),
    (Phase::Review, Phase::Build),
    (Phase::Pr, Phase::CiLoop),
    (Phase::Pr, Phase::Build),
    (Phase::CiLoop, Phase::Done),
    (Phase::CiLoop, Phase::Build),
];

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Init,
            Phase::Build,
            Phase::Review,
            Phase::Pr,
            Phase::CiLoop,
            Phase::Done,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Build => "build",
            Phase::Review => "review",
            Phase::Pr => "pr",
            Phase::CiLoop => "ci-loop",
            Phase::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done)
    }

    pub fn can_transition_to(&self, to: Phase) -> bool {
        TRANSITIONS.contains(&(*self, to))
    }

    /// What `--result` must contain when advancing out of this phase.
    pub fn expected_result(&self) -> &'static str {
        match self {
            Phase::Init => "nothing, or 'start'",
            Phase::Build => "a commit hash",
            Phase::Review => "'approved' or 'changes-requested'",
            Phase::Pr => "a pull request number",
            Phase::CiLoop => "'pass' or 'fail'",
            Phase::Done => "nothing; the feature is done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "init" => Ok(Phase::Init),
            "build" => Ok(Phase::Build),
            "review" => Ok(Phase::Review),
            "pr" => Ok(Phase::Pr),
            "ci-loop" | "ci_loop" | "ciloop" => Ok(Phase::CiLoop),
            "done" => Ok(Phase::Done),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: init, build, review, pr, ci-loop, done",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CiVerdict {
    Pass,
    Fail,
}

/// Payload confirming the outcome of the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum PhaseResult {
    Start,
    Commit(String),
    Review(ReviewVerdict),
    PullRequest(u64),
    Ci(CiVerdict),
    /// Build reopened for a workstream discovered late. Never parsed from
    /// `--result`.
    Reopened,
}

impl std::fmt::Display for PhaseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseResult::Start => write!(f, "start"),
            PhaseResult::Commit(sha) => write!(f, "commit {}", sha),
            PhaseResult::Review(ReviewVerdict::Approved) => write!(f, "review approved"),
            PhaseResult::Review(ReviewVerdict::ChangesRequested) => {
                write!(f, "review changes requested")
            }
            PhaseResult::PullRequest(n) => write!(f, "pull request #{}", n),
            PhaseResult::Ci(CiVerdict::Pass) => write!(f, "ci pass"),
            PhaseResult::Ci(CiVerdict::Fail) => write!(f, "ci fail"),
            PhaseResult::Reopened => write!(f, "reopened for a new workstream"),
        }
    }
}

impl PhaseResult {
    /// Parse a raw `--result` value in the context of the phase being left.
    pub fn parse(phase: Phase, raw: Option<&str>) -> Result<Self, PhaseError> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        let invalid = |value: &str, reason: &str| PhaseError::InvalidResult {
            phase,
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match phase {
            Phase::Done => Err(PhaseError::Terminal),
            Phase::Init => match raw {
                None => Ok(PhaseResult::Start),
                Some(v) if v.eq_ignore_ascii_case("start") => Ok(PhaseResult::Start),
                Some(v) => Err(invalid(v, "init takes no result")),
            },
            _ => {
                let Some(value) = raw else {
                    return Err(PhaseError::MissingResult {
                        phase,
                        expected: phase.expected_result(),
                    });
                };
                let lower = value.to_lowercase();
                match phase {
                    Phase::Build => {
                        if COMMIT_SHA.is_match(&lower) {
                            Ok(PhaseResult::Commit(lower))
                        } else {
                            Err(invalid(value, "expected 7-40 hex characters"))
                        }
                    }
                    Phase::Review => match lower.as_str() {
                        "approved" | "approve" | "pass" => {
                            Ok(PhaseResult::Review(ReviewVerdict::Approved))
                        }
                        "changes-requested" | "changes_requested" | "changes" | "reject" => {
                            Ok(PhaseResult::Review(ReviewVerdict::ChangesRequested))
                        }
                        _ => Err(invalid(value, "expected approved or changes-requested")),
                    },
                    Phase::Pr => {
                        let digits = lower
                            .strip_prefix("pr:")
                            .or_else(|| lower.strip_prefix('#'))
                            .unwrap_or(&lower);
                        match digits.parse::<u64>() {
                            Ok(n) if n > 0 => Ok(PhaseResult::PullRequest(n)),
                            _ => Err(invalid(value, "expected a positive pull request number")),
                        }
                    }
                    Phase::CiLoop => match lower.as_str() {
                        "pass" | "passed" | "green" | "success" => Ok(PhaseResult::Ci(CiVerdict::Pass)),
                        "fail" | "failed" | "red" | "failure" => Ok(PhaseResult::Ci(CiVerdict::Fail)),
                        _ => Err(invalid(value, "expected pass or fail")),
                    },
                    Phase::Init | Phase::Done => unreachable!("handled above"),
                }
            }
        }
    }
}

/// Apply `result` to the checkpoint, moving it along one edge of the graph.
///
/// `discovered` is the live workstream set; a build result completes the
/// current workstream (or the first pending one) and stays in build while
/// anything is still pending.
pub fn advance(
    checkpoint: &mut Checkpoint,
    result: PhaseResult,
    discovered: &[Workstream],
) -> Result<TransitionRecord, PhaseError> {
    let from = checkpoint.phase;
    if from.is_terminal() {
        return Err(PhaseError::Terminal);
    }

    let mismatch = || PhaseError::InvalidResult {
        phase: from,
        value: result.to_string(),
        reason: format!("expected {}", from.expected_result()),
    };

    let (to, workstream) = match (from, &result) {
        (Phase::Init, PhaseResult::Start) => (Phase::Build, None),
        (Phase::Build, PhaseResult::Commit(sha)) => {
            let target = checkpoint
                .current_workstream
                .clone()
                .or_else(|| checkpoint.next_workstream(discovered).map(|ws| ws.id.clone()));
            if let Some(ws_id) = &target {
                checkpoint.check_dependencies(ws_id, discovered)?;
                checkpoint.mark_completed(ws_id, sha);
            }
            checkpoint.current_workstream = None;
            let to = if checkpoint.pending(discovered).is_empty() {
                Phase::Review
            } else {
                Phase::Build
            };
            (to, target)
        }
        (Phase::Review, PhaseResult::Review(ReviewVerdict::Approved)) => {
            block_on_pending(checkpoint, discovered)?;
            (Phase::Pr, None)
        }
        (Phase::Review, PhaseResult::Review(ReviewVerdict::ChangesRequested)) => {
            (Phase::Build, None)
        }
        (Phase::Pr, PhaseResult::PullRequest(n)) => {
            block_on_pending(checkpoint, discovered)?;
            checkpoint.pr_number = Some(*n);
            (Phase::CiLoop, None)
        }
        (Phase::CiLoop, PhaseResult::Ci(CiVerdict::Pass)) => {
            block_on_pending(checkpoint, discovered)?;
            (Phase::Done, None)
        }
        (Phase::CiLoop, PhaseResult::Ci(CiVerdict::Fail)) => (Phase::Build, None),
        _ => return Err(mismatch()),
    };

    if !from.can_transition_to(to) {
        return Err(PhaseError::IllegalTransition { from, to });
    }

    let record = TransitionRecord {
        from,
        to,
        result,
        workstream,
        at: Utc::now(),
    };
    checkpoint.phase = to;
    checkpoint.history.push(record.clone());
    Ok(record)
}

fn block_on_pending(checkpoint: &Checkpoint, discovered: &[Workstream]) -> Result<(), PhaseError> {
    match checkpoint.pending(discovered).first() {
        Some(ws) => Err(PhaseError::Blocked {
            phase: checkpoint.phase,
            blocker: format!("workstream {} is still pending", ws.id),
        }),
        None => Ok(()),
    }
}

/// Send a feature that is past build back into it for `ws_id`, a workstream
/// discovered after build finished. Only review, pr and ci-loop reopen.
pub fn reopen(
    checkpoint: &mut Checkpoint,
    ws_id: &str,
    discovered: &[Workstream],
) -> Result<TransitionRecord, PhaseError> {
    let from = checkpoint.phase;
    if !matches!(from, Phase::Review | Phase::Pr | Phase::CiLoop) {
        return Err(PhaseError::IllegalTransition {
            from,
            to: Phase::Build,
        });
    }
    checkpoint.check_dependencies(ws_id, discovered)?;

    let record = TransitionRecord {
        from,
        to: Phase::Build,
        result: PhaseResult::Reopened,
        workstream: Some(ws_id.to_string()),
        at: Utc::now(),
    };
    checkpoint.phase = Phase::Build;
    checkpoint.history.push(record.clone());
    tracing::info!(feature = %checkpoint.feature_id, ws_id, from = %from, "reopened build");
    Ok(record)
}

/// Id of every workstream the checkpoint already counts as completed.
pub fn completed_ids(checkpoint: &Checkpoint) -> Vec<&str> {
    checkpoint
        .workstreams
        .iter()
        .filter(|w| w.status == WorkstreamStatus::Completed)
        .map(|w| w.id.as_str())
        .collect()
}
