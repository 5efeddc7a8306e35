//! Hooks around phase transitions.
//!
//! Hooks are external programs run before (`pre_phase`) and after
//! (`post_phase`) a transition. A `pre_phase` hook can block the transition;
//! the checkpoint is then left untouched.
//!
//! # Configuration
//!
//! Hooks are configured in `.sdp/hooks.toml` or as `[[hooks]]` entries in
//! `.sdp/config.toml`:
//!
//! ```toml
//! [[hooks]]
//! event = "pre_phase"
//! match = "review"
//! command = "./scripts/lint.sh"
//! args = ["--strict"]
//!
//! [[hooks]]
//! event = "post_phase"
//! command = "./scripts/notify.sh"
//! timeout_secs = 60
//! ```
//!
//! The command is run directly with its argument list, never through a
//! shell. It receives the [`HookContext`] as JSON on stdin and the
//! `SDP_EVENT`, `SDP_PHASE`, `SDP_FEATURE` and `SDP_WORKSTREAM` environment
//! variables. Exit 0 continues; any other exit, or a timeout, blocks.

pub mod config;
pub mod executor;
pub mod manager;
pub mod types;

pub use config::{HookDefinition, HooksConfig};
pub use executor::HookExecutor;
pub use manager::HookManager;
pub use types::{HookAction, HookContext, HookEvent, HookResult};
