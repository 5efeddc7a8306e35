//! Hook configuration parsing and validation.
//!
//! Hook definitions come from:
//! - `.sdp/hooks.toml`: dedicated hooks file
//! - `[[hooks]]` entries in `.sdp/config.toml`: unified configuration

use super::types::HookEvent;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single hook definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookDefinition {
    /// The event that triggers this hook
    pub event: HookEvent,

    /// Optional glob matched against the phase name ("ci-*", "build")
    #[serde(default)]
    pub r#match: Option<String>,

    /// Program to execute; relative paths resolve against the working dir
    pub command: String,

    /// Fixed argument list. Never interpreted by a shell.
    #[serde(default)]
    pub args: Vec<String>,

    /// Defaults to the project directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl HookDefinition {
    pub fn command(event: HookEvent, command: impl Into<String>) -> Self {
        Self {
            event,
            r#match: None,
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            timeout_secs: default_timeout(),
            enabled: true,
            description: None,
        }
    }

    pub fn with_match(mut self, pattern: impl Into<String>) -> Self {
        self.r#match = Some(pattern.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check if this hook should trigger for a given phase name.
    /// Matching is case-insensitive; an invalid glob matches nothing.
    pub fn matches_phase(&self, phase_name: &str) -> bool {
        match &self.r#match {
            Some(pattern) => glob::Pattern::new(&pattern.to_lowercase())
                .map(|p| p.matches(&phase_name.to_lowercase()))
                .unwrap_or(false),
            None => true,
        }
    }

    /// Validate this hook definition.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.command.trim().is_empty() {
            warnings.push(format!("Hook for event '{}' has an empty command", self.event));
        }
        if let Some(pattern) = &self.r#match
            && glob::Pattern::new(pattern).is_err()
        {
            warnings.push(format!(
                "Hook for event '{}' has invalid match pattern '{}'",
                self.event, pattern
            ));
        }
        if self.timeout_secs == 0 {
            warnings.push(format!(
                "Hook for event '{}' has timeout of 0 seconds",
                self.event
            ));
        }
        warnings
    }
}

/// Configuration for all hooks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub hooks: Vec<HookDefinition>,
}

impl HooksConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hooks file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse hooks.toml")
    }

    /// Load `.sdp/hooks.toml`; empty config if the file doesn't exist.
    pub fn load_or_default(sdp_dir: &Path) -> Result<Self> {
        let hooks_path = sdp_dir.join("hooks.toml");
        if hooks_path.exists() {
            Self::load(&hooks_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.hooks.extend(other.hooks);
    }

    pub fn hooks_for_event_and_phase(
        &self,
        event: HookEvent,
        phase_name: &str,
    ) -> Vec<&HookDefinition> {
        self.hooks
            .iter()
            .filter(|h| h.enabled && h.event == event && h.matches_phase(phase_name))
            .collect()
    }

    pub fn validate(&self) -> Vec<String> {
        self.hooks.iter().flat_map(|h| h.validate()).collect()
    }

    pub fn enabled_hook_count(&self) -> usize {
        self.hooks.iter().filter(|h| h.enabled).count()
    }
}
