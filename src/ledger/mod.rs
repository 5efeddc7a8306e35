//! Tamper-evident ledger: the per-worktree [`Session`] and the append-only
//! [`DecisionLog`].

pub mod decisions;
pub mod session;

pub use decisions::{DECISIONS_FILE, Decision, DecisionLog, DecisionType};
pub use session::{Drift, SESSION_FILE, Session, default_actor, session_path};
