//! `sdp checkpoint`: inspect stored checkpoints.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use super::super::CheckpointCommands;
use super::print_json;

#[derive(Serialize)]
struct Row {
    feature_id: String,
    phase: String,
    completed: usize,
    total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_workstream: Option<String>,
    branch: String,
}

pub fn cmd_checkpoint(project_dir: &Path, verbose: bool, command: &CheckpointCommands) -> Result<()> {
    use sdp::checkpoint::WorkstreamStatus;
    use sdp::config::{CliOverrides, Config};
    use sdp::errors::SdpError;

    match command {
        CheckpointCommands::List {
            checkpoint_dir,
            json,
        } => {
            let overrides = CliOverrides {
                checkpoint_dir: checkpoint_dir.clone(),
                ..Default::default()
            };
            let config = Config::new(project_dir, verbose, overrides)?;
            let store = config.checkpoint_store();

            let mut rows = Vec::new();
            for feature_id in store.list().map_err(SdpError::from)? {
                let checkpoint = match store.load(&feature_id) {
                    Ok(cp) => cp,
                    Err(e) => {
                        tracing::warn!(feature = %feature_id, error = %e, "skipping unreadable checkpoint");
                        continue;
                    }
                };
                rows.push(Row {
                    completed: checkpoint
                        .workstreams
                        .iter()
                        .filter(|w| w.status == WorkstreamStatus::Completed)
                        .count(),
                    total: checkpoint.workstreams.len(),
                    phase: checkpoint.phase.to_string(),
                    current_workstream: checkpoint.current_workstream,
                    branch: checkpoint.branch,
                    feature_id,
                });
            }

            if *json {
                for row in &rows {
                    print_json(row)?;
                }
                return Ok(());
            }

            if rows.is_empty() {
                println!();
                println!("No checkpoints in {}", config.checkpoint_dir.display());
                println!();
                return Ok(());
            }

            println!();
            println!("{:<8} {:<10} {:<8} {:<12} Branch", "Feature", "Phase", "Done", "Current");
            println!("{:<8} {:<10} {:<8} {:<12} ------", "-------", "-----", "----", "-------");
            for row in &rows {
                println!(
                    "{:<8} {:<10} {:<8} {:<12} {}",
                    row.feature_id,
                    row.phase,
                    format!("{}/{}", row.completed, row.total),
                    row.current_workstream.as_deref().unwrap_or("-"),
                    if row.branch.is_empty() { "-" } else { row.branch.as_str() }
                );
            }
            println!();
        }
    }
    Ok(())
}
