//! `sdp policy eval`.

use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::super::PolicyCommands;
use super::print_json;

pub async fn cmd_policy(
    project_dir: &Path,
    verbose: bool,
    command: &PolicyCommands,
    cancel: CancellationToken,
) -> Result<()> {
    use sdp::config::{CliOverrides, Config};
    use sdp::errors::SdpError;
    use sdp::orchestrator::Engine;
    use sdp::phase::Phase;

    match command {
        PolicyCommands::Eval {
            feature,
            phase,
            changed,
        } => {
            let phase: Option<Phase> = phase.as_deref().map(str::parse).transpose()?;
            let changed = (!changed.is_empty()).then(|| changed.clone());

            let config = Config::new(project_dir, verbose, CliOverrides::default())?;
            let engine = Engine::new(config, cancel)?;
            let input = engine.policy_input(feature, phase, changed).await?;
            tracing::debug!(input = ?input, "policy input");
            let result = engine.evaluate_input(&input).await;

            print_json(&result)?;
            if result.blocks() {
                return Err(SdpError::PolicyDenied {
                    denials: result.denials,
                    warnings: result.warnings,
                }
                .into());
            }
        }
    }
    Ok(())
}
