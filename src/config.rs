use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::{CheckpointStore, RunsDir};
use crate::hooks::HooksConfig;
use crate::ledger::{DECISIONS_FILE, SESSION_FILE};
use crate::policy::POLICY_DIR;
use crate::policy::input::EVIDENCE_DIR;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::sdp_config::SdpToml;
use crate::workstream::BACKLOG_DIR;

/// CLI overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub checkpoint_dir: Option<PathBuf>,
    pub runs_dir: Option<PathBuf>,
}

/// Runtime configuration.
///
/// Bridges `.sdp/config.toml` with environment variables and CLI flags and
/// resolves every path the engine touches against the project directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub sdp_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub policy_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub session_file: PathBuf,
    pub decisions_file: PathBuf,
    pub backlog_dir: PathBuf,
    pub opa_bin: String,
    pub policy_package: String,
    pub policy_timeout: Duration,
    pub agent_cmd: String,
    pub agent_timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub hooks: HooksConfig,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for `project_dir`: file, then process environment,
    /// then `overrides`.
    pub fn new(project_dir: &Path, verbose: bool, overrides: CliOverrides) -> Result<Self> {
        Self::with_env(project_dir, verbose, overrides, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::new`] with an explicit environment lookup.
    pub fn with_env<F>(
        project_dir: &Path,
        verbose: bool,
        overrides: CliOverrides,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let sdp_dir = project_dir.join(".sdp");
        let toml = SdpToml::load_or_default(&sdp_dir)?;
        for warning in toml.validate() {
            tracing::warn!("{}", warning);
        }

        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                project_dir.join(p)
            }
        };
        let env_path = |key: &str| env(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let checkpoint_dir = overrides
            .checkpoint_dir
            .or_else(|| env_path("SDP_CHECKPOINT_DIR"))
            .or_else(|| toml.paths.checkpoint_dir.clone())
            .map(|p| resolve(&p))
            .unwrap_or_else(|| sdp_dir.join("checkpoints"));
        let runs_dir = overrides
            .runs_dir
            .or_else(|| env_path("SDP_RUNS_DIR"))
            .or_else(|| toml.paths.runs_dir.clone())
            .map(|p| resolve(&p))
            .unwrap_or_else(|| sdp_dir.join("runs"));
        let policy_dir = toml
            .paths
            .policy_dir
            .as_deref()
            .map(resolve)
            .unwrap_or_else(|| project_dir.join(POLICY_DIR));
        let evidence_dir = toml
            .paths
            .evidence_dir
            .as_deref()
            .map(resolve)
            .unwrap_or_else(|| project_dir.join(EVIDENCE_DIR));
        let decisions_file = toml
            .paths
            .decisions_file
            .as_deref()
            .map(resolve)
            .unwrap_or_else(|| project_dir.join(DECISIONS_FILE));

        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let opa_bin = non_empty("SDP_OPA_BIN").unwrap_or_else(|| toml.policy.binary.clone());
        let agent_cmd = non_empty("SDP_AGENT_CMD").unwrap_or_else(|| toml.runtime.agent_cmd.clone());

        Ok(Self {
            session_file: project_dir.join(SESSION_FILE),
            backlog_dir: project_dir.join(BACKLOG_DIR),
            checkpoint_dir,
            runs_dir,
            policy_dir,
            evidence_dir,
            decisions_file,
            opa_bin,
            policy_package: toml.policy.package.clone(),
            policy_timeout: Duration::from_secs(toml.policy.timeout_secs),
            agent_cmd,
            agent_timeout: Duration::from_secs(toml.runtime.agent_timeout_secs),
            retry: toml.resilience.retry_config(),
            breaker: toml.resilience.breaker_config(),
            hooks: toml.hooks_config(),
            verbose,
            sdp_dir,
            project_dir,
        })
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.checkpoint_dir)
    }

    pub fn runs(&self) -> RunsDir {
        RunsDir::new(&self.runs_dir)
    }
}
