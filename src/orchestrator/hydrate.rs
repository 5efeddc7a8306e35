//! Context packets handed to whoever executes the next phase.

use crate::ledger::Decision;
use crate::phase::Phase;
use crate::policy::PolicyResult;
use crate::resolver::Action;
use crate::workstream::Workstream;
use serde::Serialize;

/// How many of the latest decisions a packet carries.
pub const RECENT_DECISIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkstreamBrief {
    pub id: String,
    pub title: String,
    pub body: String,
}

impl From<&Workstream> for WorkstreamBrief {
    fn from(ws: &Workstream) -> Self {
        Self {
            id: ws.id.clone(),
            title: ws.title.clone(),
            body: ws.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPacket {
    pub feature_id: String,
    pub phase: Phase,
    pub branch: String,
    pub workstream: Option<WorkstreamBrief>,
    pub pending_workstreams: Vec<String>,
    pub recent_decisions: Vec<Decision>,
    pub policy: PolicyResult,
    pub next_action: Action,
}

/// The last [`RECENT_DECISIONS`] entries, oldest first.
pub fn recent(mut decisions: Vec<Decision>) -> Vec<Decision> {
    let skip = decisions.len().saturating_sub(RECENT_DECISIONS);
    decisions.drain(..skip);
    decisions
}

impl ContextPacket {
    /// Markdown prompt for an agent runtime.
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# {} for {}\n\nPhase: {}\nBranch: {}\n",
            self.next_action, self.feature_id, self.phase, self.branch
        ));

        if let Some(ws) = &self.workstream {
            out.push_str(&format!("\n## Workstream {}: {}\n\n{}\n", ws.id, ws.title, ws.body.trim()));
        }

        if !self.pending_workstreams.is_empty() {
            out.push_str("\n## Pending workstreams\n\n");
            for id in &self.pending_workstreams {
                out.push_str(&format!("- {}\n", id));
            }
        }

        if !self.policy.denials.is_empty() || !self.policy.warnings.is_empty() {
            out.push_str("\n## Policy\n\n");
            for d in &self.policy.denials {
                out.push_str(&format!("- DENY: {}\n", d));
            }
            for w in &self.policy.warnings {
                out.push_str(&format!("- WARN: {}\n", w));
            }
        }

        if !self.recent_decisions.is_empty() {
            out.push_str("\n## Recent decisions\n\n");
            for d in &self.recent_decisions {
                out.push_str(&format!("- [{}] {} -> {}\n", d.decision_type, d.question, d.decision));
            }
        }

        out.push_str(
            "\nWhen the work is finished, report the result so the phase can be advanced.\n",
        );
        out
    }
}
