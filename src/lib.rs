pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod policy;
pub mod process;
pub mod resilience;
pub mod resolver;
pub mod sdp_config;
pub mod tracker;
pub mod util;
pub mod workstream;
