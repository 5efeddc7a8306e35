use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

mod cmd;

#[derive(Parser)]
#[command(name = "sdp")]
#[command(version, about = "Checkpointed phase orchestration for spec-driven delivery")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a feature through build, review, pr and ci-loop
    Orchestrate(OrchestrateArgs),
    /// Manage the worktree session identity
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Record and browse the decision log
    Decisions {
        #[command(subcommand)]
        command: DecisionCommands,
    },
    /// Evaluate policies against the current facts
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Inspect stored checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Runtime {
    Opencode,
}

#[derive(Args, Debug)]
pub struct OrchestrateArgs {
    /// Feature id, e.g. F016
    #[arg(long)]
    pub feature: String,

    /// Print the next action as JSON (default)
    #[arg(long, group = "mode")]
    pub next_action: bool,

    /// Confirm the current phase and transition
    #[arg(long, group = "mode")]
    pub advance: bool,

    /// Phase result: commit sha, approved/changes-requested, pr:<n>, pass/fail
    #[arg(long, requires = "advance")]
    pub result: Option<String>,

    /// Print the context packet for the next phase
    #[arg(long, group = "mode")]
    pub hydrate: bool,

    /// Workstream to hydrate instead of the next one
    #[arg(long, requires = "hydrate")]
    pub ws: Option<String>,

    /// Show the stored checkpoint and runs
    #[arg(long, group = "mode")]
    pub status: bool,

    /// Fail instead of creating a missing checkpoint
    #[arg(long)]
    pub resume: bool,

    /// Delegate the next phase to an agent runtime
    #[arg(long, value_enum, conflicts_with_all = ["advance", "hydrate", "status"])]
    pub runtime: Option<Runtime>,

    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Pin this worktree to a feature
    Init {
        #[arg(long)]
        feature: String,
        /// Overwrite an existing session
        #[arg(long)]
        force: bool,
    },
    /// Print the session file
    Show,
    /// Check the session hash and compare it with git
    Verify,
    /// Recreate the session from git state
    Repair {
        #[arg(long)]
        feature: String,
    },
    /// Adopt the current branch and remote
    Sync,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// List features with a checkpoint, with phase and progress
    List {
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DecisionCommands {
    /// Append a decision
    Log {
        /// vision, technical, tradeoff or explicit
        #[arg(long = "type")]
        decision_type: String,
        #[arg(long)]
        question: String,
        #[arg(long)]
        decision: String,
        #[arg(long)]
        rationale: Option<String>,
        #[arg(long, value_delimiter = ',')]
        alternatives: Vec<String>,
        #[arg(long)]
        maker: Option<String>,
        #[arg(long)]
        feature: Option<String>,
        #[arg(long)]
        ws: Option<String>,
    },
    /// List decisions
    List {
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        feature: Option<String>,
        /// Case-insensitive substring over question, decision and rationale
        #[arg(long)]
        search: Option<String>,
        /// Print JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommands {
    /// Evaluate and print the verdict as JSON
    Eval {
        #[arg(long)]
        feature: String,
        /// Phase to evaluate for; defaults to the checkpoint's phase
        #[arg(long)]
        phase: Option<String>,
        /// Changed files; defaults to the git working tree diff
        #[arg(long, num_args = 1..)]
        changed: Vec<String>,
    },
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Orchestrate(args) => {
            cmd::cmd_orchestrate(&project_dir, cli.verbose, args, cancel).await?;
        }
        Commands::Session { command } => {
            cmd::cmd_session(&project_dir, cli.verbose, command, cancel).await?;
        }
        Commands::Decisions { command } => {
            cmd::cmd_decisions(&project_dir, cli.verbose, command)?;
        }
        Commands::Policy { command } => {
            cmd::cmd_policy(&project_dir, cli.verbose, command, cancel).await?;
        }
        Commands::Checkpoint { command } => {
            cmd::cmd_checkpoint(&project_dir, cli.verbose, command)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Usage errors exit 1 like every other failure; help and version exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            e.print().context("Failed to print usage error")?;
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };
    sdp::logging::init(cli.verbose);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling in-flight work");
            on_signal.cancel();
        }
    });

    if let Err(err) = run(cli, cancel).await {
        cmd::report_error(&err);
        std::process::exit(1);
    }
    Ok(())
}
