//! `sdp orchestrate`: next action, advance, hydrate, status and agent
//! delegation for one feature.

use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::super::{OrchestrateArgs, Runtime};
use super::{print_json, print_json_pretty};

pub async fn cmd_orchestrate(
    project_dir: &Path,
    verbose: bool,
    args: &OrchestrateArgs,
    cancel: CancellationToken,
) -> Result<()> {
    use sdp::agent::OpencodeRunner;
    use sdp::config::{CliOverrides, Config};
    use sdp::orchestrator::Engine;

    let overrides = CliOverrides {
        checkpoint_dir: args.checkpoint_dir.clone(),
        runs_dir: args.runs_dir.clone(),
    };
    let config = Config::new(project_dir, verbose, overrides)?;
    let engine = Engine::new(config, cancel)?;
    let feature = args.feature.as_str();

    if args.status {
        let report = engine.status(feature)?;
        return print_json_pretty(&report);
    }

    if args.advance {
        let outcome = engine
            .advance(feature, args.result.as_deref(), args.resume)
            .await?;
        eprintln!(
            "{} {} {} -> {}",
            console::style("advanced").green().bold(),
            feature,
            outcome.transition.from,
            outcome.transition.to
        );
        return print_json_pretty(&outcome);
    }

    if args.hydrate {
        let packet = engine
            .hydrate(feature, args.ws.as_deref(), args.resume)
            .await?;
        return print_json_pretty(&packet);
    }

    if let Some(Runtime::Opencode) = args.runtime {
        let runner = OpencodeRunner::new(engine.config().agent_cmd.clone())
            .with_timeout(engine.config().agent_timeout);
        let outcome = engine.run_agent(feature, &runner, args.resume).await?;
        print_json_pretty(&outcome)?;
        if !outcome.success {
            anyhow::bail!(
                "{} exited unsuccessfully (code {:?})",
                outcome.runtime,
                outcome.exit_code
            );
        }
        return Ok(());
    }

    let action = engine.next_action(feature, args.resume).await?;
    print_json(&action)
}
