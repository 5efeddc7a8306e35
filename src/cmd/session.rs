//! `sdp session`: worktree identity.

use anyhow::{Context, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::super::SessionCommands;
use super::print_json_pretty;

pub async fn cmd_session(
    project_dir: &Path,
    verbose: bool,
    command: &SessionCommands,
    cancel: CancellationToken,
) -> Result<()> {
    use sdp::checkpoint::validate_feature_id;
    use sdp::config::{CliOverrides, Config};
    use sdp::errors::SdpError;
    use sdp::ledger::{Session, default_actor};
    use sdp::resilience::{CircuitBreaker, Guard};
    use sdp::tracker::{GitCli, Vcs};

    let config = Config::new(project_dir, verbose, CliOverrides::default())?;
    let root = config.project_dir.as_path();
    let vcs = GitCli::new(root);
    let breaker = CircuitBreaker::new("git", config.breaker.clone());
    let git = Guard::new(&breaker, &config.retry, &cancel);

    match command {
        SessionCommands::Init { feature, force } => {
            validate_feature_id(feature).map_err(SdpError::from)?;
            if !force && config.session_file.exists() {
                anyhow::bail!(
                    "Session already exists at {} (use --force to overwrite)",
                    config.session_file.display()
                );
            }
            let mut session = Session::init(feature, root, &default_actor());
            match git.call(|| vcs.current_branch()).await {
                Ok(branch) => session.expected_branch = branch,
                Err(e) => tracing::warn!(error = %e, "could not read branch; leaving it unset"),
            }
            match git.call(|| vcs.remote_url()).await {
                Ok(remote) => session.expected_remote = remote.unwrap_or_default(),
                Err(e) => tracing::warn!(error = %e, "could not read remote; leaving it unset"),
            }
            session.save(root).map_err(SdpError::from)?;
            println!(
                "{} session for {} at {}",
                console::style("Created").green().bold(),
                feature,
                config.session_file.display()
            );
        }
        SessionCommands::Show => {
            let session = Session::load(root).map_err(SdpError::from)?;
            print_json_pretty(&session)?;
        }
        SessionCommands::Verify => {
            let session = Session::load(root).map_err(SdpError::from)?;
            let drift: Vec<_> = session
                .check_worktree(&vcs, git)
                .await?
                .into_iter()
                .filter(|d| !d.expected.is_empty())
                .collect();
            if drift.is_empty() {
                println!(
                    "{} session for {} matches the worktree",
                    console::style("OK").green().bold(),
                    session.feature_id
                );
            } else {
                for d in &drift {
                    println!("  {} {}", console::style("drift:").yellow(), d);
                }
                anyhow::bail!(
                    "Session drifted from the worktree; run `sdp session sync` to adopt it"
                );
            }
        }
        SessionCommands::Repair { feature } => {
            validate_feature_id(feature).map_err(SdpError::from)?;
            let session = Session::repair(root, feature, &default_actor(), &vcs, git)
                .await
                .context("Failed to repair session")?;
            println!(
                "{} session for {} on {}",
                console::style("Repaired").green().bold(),
                session.feature_id,
                session.expected_branch
            );
        }
        SessionCommands::Sync => {
            let mut session = Session::load(root).map_err(SdpError::from)?;
            let changes = session.sync(root, &vcs, git).await?;
            if changes.is_empty() {
                println!("Session already in sync");
            } else {
                for d in &changes {
                    println!("  {} {}", console::style("updated:").cyan(), d);
                }
            }
        }
    }
    Ok(())
}
