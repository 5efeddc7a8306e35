//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module        | Commands handled |
//! |---------------|------------------|
//! | `orchestrate` | `Orchestrate`    |
//! | `session`     | `Session`        |
//! | `decisions`   | `Decisions`      |
//! | `policy`      | `Policy`         |
//! | `checkpoint`  | `Checkpoint`     |

pub mod checkpoint;
pub mod decisions;
pub mod orchestrate;
pub mod policy;
pub mod session;

pub use checkpoint::cmd_checkpoint;
pub use decisions::cmd_decisions;
pub use orchestrate::cmd_orchestrate;
pub use policy::cmd_policy;
pub use session::cmd_session;

use sdp::errors::SdpError;

/// Print a failed invocation to stderr, with its class and a hint when
/// one applies.
pub fn report_error(err: &anyhow::Error) {
    let typed = err.chain().find_map(|e| e.downcast_ref::<SdpError>());
    let label = match typed {
        Some(e) => format!("error[{}]:", e.kind()),
        None => "error:".to_string(),
    };
    eprintln!("{} {:#}", console::style(label).red().bold(), err);
    if let Some(SdpError::PolicyDenied { warnings, .. }) = typed {
        for warning in warnings {
            eprintln!("  {} {}", console::style("warning:").yellow(), warning);
        }
    }
    if let Some(hint) = typed.and_then(SdpError::hint) {
        eprintln!("  {} {}", console::style("hint:").cyan(), hint);
    }
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn print_json_pretty<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
