//! Next-action resolution.
//!
//! [`compute_next_action`] is pure: it reads the checkpoint, the live
//! workstream set and a snapshot of repository facts, and returns exactly one
//! action. Gathering the facts (git, `gh`) happens elsewhere.

use crate::checkpoint::Checkpoint;
use crate::phase::Phase;
use crate::workstream::Workstream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiStatus {
    Pending,
    Green,
    Red,
}

/// Read-only snapshot of repository state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoFacts {
    pub branch: String,
    pub open_pr: Option<u64>,
    pub reviews_passed: bool,
    pub ci: Option<CiStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    Build { ws_id: String },
    Review { feature_id: String },
    Pr,
    CiLoop { pr_number: u64, feature_id: String },
    Done,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Build { .. } => "build",
            Action::Review { .. } => "review",
            Action::Pr => "pr",
            Action::CiLoop { .. } => "ci-loop",
            Action::Done => "done",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Build { ws_id } => write!(f, "build {}", ws_id),
            Action::Review { feature_id } => write!(f, "review {}", feature_id),
            Action::Pr => write!(f, "pr"),
            Action::CiLoop { pr_number, feature_id } => {
                write!(f, "ci-loop #{} for {}", pr_number, feature_id)
            }
            Action::Done => write!(f, "done"),
        }
    }
}

/// Decide the single next action.
///
/// Pending workstreams are derived from `workstreams` (live discovery), so
/// workstreams added after the checkpoint was created are scheduled too,
/// whatever phase the feature has reached short of `done`. A workstream
/// whose prerequisites are still pending waits behind them.
pub fn compute_next_action(
    checkpoint: &Checkpoint,
    workstreams: &[Workstream],
    facts: &RepoFacts,
) -> Action {
    let review = || Action::Review {
        feature_id: checkpoint.feature_id.clone(),
    };

    if !checkpoint.phase.is_terminal()
        && let Some(ws) = checkpoint.next_workstream(workstreams)
    {
        return Action::Build {
            ws_id: ws.id.clone(),
        };
    }

    match checkpoint.phase {
        Phase::Init | Phase::Build => review(),
        Phase::Review => {
            if facts.reviews_passed {
                Action::Pr
            } else {
                review()
            }
        }
        Phase::Pr => match facts.open_pr.or(checkpoint.pr_number) {
            Some(pr_number) => Action::CiLoop {
                pr_number,
                feature_id: checkpoint.feature_id.clone(),
            },
            None => Action::Pr,
        },
        Phase::CiLoop => {
            if facts.ci == Some(CiStatus::Green) {
                return Action::Done;
            }
            match facts.open_pr.or(checkpoint.pr_number) {
                Some(pr_number) => Action::CiLoop {
                    pr_number,
                    feature_id: checkpoint.feature_id.clone(),
                },
                None => Action::Pr,
            }
        }
        Phase::Done => Action::Done,
    }
}
