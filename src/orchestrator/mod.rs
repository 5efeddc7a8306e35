//! The control loop: checkpoint, next action, hooks, policy, transition,
//! ledger.

pub mod engine;
pub mod hydrate;

pub use engine::{AdvanceOutcome, Engine, StatusReport};
pub use hydrate::{ContextPacket, WorkstreamBrief};
