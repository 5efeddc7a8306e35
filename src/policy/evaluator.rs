//! Policy evaluator adapters.
//!
//! Only the three queries in [`PolicyQuery`] can ever be sent to the
//! evaluator; nothing user-supplied reaches its argument list.

use crate::errors::ExternalError;
use crate::process::{ToolCommand, find_on_path, run_tool};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

static PACKAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyQuery {
    EnforcementLevel,
    Deny,
    Warn,
}

impl PolicyQuery {
    pub fn all() -> [PolicyQuery; 3] {
        [
            PolicyQuery::EnforcementLevel,
            PolicyQuery::Deny,
            PolicyQuery::Warn,
        ]
    }

    fn rule(&self) -> &'static str {
        match self {
            PolicyQuery::EnforcementLevel => "enforcement_level",
            PolicyQuery::Deny => "deny",
            PolicyQuery::Warn => "warn",
        }
    }

    /// Full query path, e.g. `data.sdp.deny`. The package must be a plain
    /// dotted identifier.
    pub fn path(&self, package: &str) -> Result<String, ExternalError> {
        if !PACKAGE_NAME.is_match(package) {
            return Err(ExternalError::rejected(
                "opa",
                format!("invalid policy package name '{}'", package),
            ));
        }
        Ok(format!("data.{}.{}", package, self.rule()))
    }
}

#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Whether the evaluator can be invoked at all.
    fn is_available(&self) -> bool;

    /// Evaluate one allow-listed query against `input` and return its value
    /// (`Null` when the rule is undefined).
    async fn query(
        &self,
        policy_dir: &Path,
        query: PolicyQuery,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, ExternalError>;
}

/// Production evaluator: the `opa` binary.
#[derive(Debug, Clone)]
pub struct OpaEvaluator {
    binary: String,
    package: String,
    timeout: Duration,
}

impl OpaEvaluator {
    pub fn new(binary: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            package: package.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct OpaOutput {
    #[serde(default)]
    result: Vec<OpaResult>,
}

#[derive(Debug, Deserialize)]
struct OpaResult {
    #[serde(default)]
    expressions: Vec<OpaExpression>,
}

#[derive(Debug, Deserialize)]
struct OpaExpression {
    value: serde_json::Value,
}

/// Pull the first expression value out of `opa eval --format json` output.
fn parse_opa_output(stdout: &str) -> Result<serde_json::Value, ExternalError> {
    let parsed: OpaOutput = serde_json::from_str(stdout.trim())
        .map_err(|e| ExternalError::rejected("opa", format!("unexpected output: {}", e)))?;
    Ok(parsed
        .result
        .into_iter()
        .next()
        .and_then(|r| r.expressions.into_iter().next())
        .map(|e| e.value)
        .unwrap_or(serde_json::Value::Null))
}

#[async_trait]
impl PolicyEvaluator for OpaEvaluator {
    fn is_available(&self) -> bool {
        find_on_path(&self.binary).is_some()
    }

    async fn query(
        &self,
        policy_dir: &Path,
        query: PolicyQuery,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, ExternalError> {
        let path = query.path(&self.package)?;
        let stdin = serde_json::to_string(input)
            .map_err(|e| ExternalError::rejected("opa", format!("unserializable input: {}", e)))?;
        let cmd = ToolCommand::new(&self.binary)
            .args(["eval", "--format", "json", "--data"])
            .arg(policy_dir.to_string_lossy().to_string())
            .arg("--stdin-input")
            .arg(path)
            .stdin(stdin)
            .timeout(self.timeout);

        let out = run_tool(&cmd).await?;
        if !out.success() {
            return Err(ExternalError::rejected(
                "opa",
                format!("exit {:?}: {}", out.code, out.stderr.trim()),
            ));
        }
        parse_opa_output(&out.stdout)
    }
}

/// In-memory evaluator returning canned values per query.
#[derive(Debug, Default)]
pub struct FakeEvaluator {
    pub available: bool,
    responses: Mutex<HashMap<PolicyQuery, Result<serde_json::Value, String>>>,
    calls: Mutex<Vec<(PolicyQuery, serde_json::Value)>>,
}

impl FakeEvaluator {
    pub fn new() -> Self {
        Self {
            available: true,
            ..Default::default()
        }
    }

    pub fn respond(self, query: PolicyQuery, value: serde_json::Value) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(query, Ok(value));
        self
    }

    /// Make `query` fail with a non-retryable error.
    pub fn fail(self, query: PolicyQuery, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(query, Err(message.to_string()));
        self
    }

    /// Every query received, with the input it was given.
    pub fn calls(&self) -> Vec<(PolicyQuery, serde_json::Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PolicyEvaluator for FakeEvaluator {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn query(
        &self,
        _policy_dir: &Path,
        query: PolicyQuery,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, ExternalError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((query, input.clone()));
        match self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&query)
        {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(ExternalError::rejected("fake-opa", message.clone())),
            None => Ok(serde_json::Value::Null),
        }
    }
}
