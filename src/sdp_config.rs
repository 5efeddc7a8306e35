//! Unified configuration file for sdp.
//!
//! Reads `.sdp/config.toml`. Every section is optional and falls back to
//! defaults; a file that exists but fails to parse is an error.
//!
//! # Configuration File Format
//!
//! ```toml
//! [paths]
//! checkpoint_dir = ".sdp/checkpoints"
//! runs_dir = ".sdp/runs"
//!
//! [resilience]
//! max_attempts = 3
//! initial_delay_ms = 200
//! max_delay_ms = 5000
//! multiplier = 2.0
//! jitter = true
//! failure_threshold = 5
//! success_threshold = 2
//! breaker_timeout_secs = 30
//!
//! [policy]
//! binary = "opa"
//! package = "sdp"
//!
//! [runtime]
//! agent_cmd = "opencode"
//!
//! [[hooks]]
//! event = "pre_phase"
//! match = "review"
//! command = "./scripts/lint.sh"
//! ```

use crate::hooks::{HookDefinition, HooksConfig};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";

/// Path overrides, relative to the project directory unless absolute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub runs_dir: Option<PathBuf>,
    #[serde(default)]
    pub policy_dir: Option<PathBuf>,
    #[serde(default)]
    pub evidence_dir: Option<PathBuf>,
    #[serde(default)]
    pub decisions_file: Option<PathBuf>,
}

/// Retry and circuit breaker tuning shared by every external dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_breaker_timeout_secs")]
    pub breaker_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout_secs() -> u64 {
    30
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            breaker_timeout_secs: default_breaker_timeout_secs(),
        }
    }
}

impl ResilienceSection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            success_threshold: self.success_threshold.max(1),
            timeout: Duration::from_secs(self.breaker_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    /// Evaluator binary, looked up on PATH.
    #[serde(default = "default_policy_binary")]
    pub binary: String,
    /// Rego package holding the `deny`, `warn` and `enforcement_level` rules.
    #[serde(default = "default_policy_package")]
    pub package: String,
    #[serde(default = "default_policy_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_policy_binary() -> String {
    "opa".to_string()
}

fn default_policy_package() -> String {
    "sdp".to_string()
}

fn default_policy_timeout_secs() -> u64 {
    10
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            binary: default_policy_binary(),
            package: default_policy_package(),
            timeout_secs: default_policy_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Agent runner command used by `--runtime opencode`.
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
}

fn default_agent_cmd() -> String {
    "opencode".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    3_600
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            agent_cmd: default_agent_cmd(),
            agent_timeout_secs: default_agent_timeout_secs(),
        }
    }
}

/// The complete `.sdp/config.toml` structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdpToml {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub resilience: ResilienceSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    /// Hook definitions (alternative to hooks.toml)
    #[serde(default)]
    pub hooks: Vec<HookDefinition>,
}

impl SdpToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load `.sdp/config.toml`; defaults if the file doesn't exist.
    pub fn load_or_default(sdp_dir: &Path) -> Result<Self> {
        let config_path = sdp_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn hooks_config(&self) -> HooksConfig {
        HooksConfig {
            hooks: self.hooks.clone(),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let r = &self.resilience;
        if r.max_attempts == 0 {
            warnings.push("resilience.max_attempts is 0; using 1".to_string());
        }
        if r.multiplier < 1.0 {
            warnings.push(format!(
                "resilience.multiplier {} is below 1.0; delays will not grow",
                r.multiplier
            ));
        }
        if r.initial_delay_ms > r.max_delay_ms {
            warnings.push(format!(
                "resilience.initial_delay_ms ({}) exceeds max_delay_ms ({})",
                r.initial_delay_ms, r.max_delay_ms
            ));
        }
        if self.policy.binary.trim().is_empty() {
            warnings.push("policy.binary is empty".to_string());
        }
        if self.runtime.agent_cmd.trim().is_empty() {
            warnings.push("runtime.agent_cmd is empty".to_string());
        }
        warnings.extend(self.hooks_config().validate());
        warnings
    }
}
