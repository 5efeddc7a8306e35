//! Typed error hierarchy for the sdp control plane.
//!
//! Each subsystem owns one enum; all of them roll up into [`SdpError`], which
//! classifies every failure into one of five [`ErrorKind`]s:
//!
//! - `Environment`: missing tool or bad working directory; never retried
//! - `Protocol`: malformed state or invalid identifiers; always fatal
//! - `Dependency`: a prior workstream or phase is not complete
//! - `Validation`: policy denial or a blocking hook
//! - `Runtime`: transient external failure, eligible for retry

use crate::phase::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Propagation class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Environment,
    Protocol,
    Dependency,
    Validation,
    Runtime,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Environment => "environment",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Validation => "validation",
            ErrorKind::Runtime => "runtime",
        };
        f.write_str(s)
    }
}

/// Errors from the checkpoint store and runs directory.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Invalid feature id '{0}': expected F<digits> or NN-NNN, no path components")]
    InvalidFeatureId(String),

    #[error("No checkpoint for feature {feature_id} at {}", path.display())]
    NotFound { feature_id: String, path: PathBuf },

    #[error("Checkpoint at {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint at {} has unsupported schema version {version}", path.display())]
    UnsupportedSchema { path: PathBuf, version: u32 },

    #[error("Checkpoint I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the phase state machine.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("Phase {phase} requires a result ({expected})")]
    MissingResult { phase: Phase, expected: &'static str },

    #[error("Result '{value}' is not valid for phase {phase}: {reason}")]
    InvalidResult {
        phase: Phase,
        value: String,
        reason: String,
    },

    #[error("Feature is already done; no further transitions")]
    Terminal,

    #[error("Blocked in {phase}: {blocker}")]
    Blocked { phase: Phase, blocker: String },
}

/// Errors from the session record.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session file at {}", .0.display())]
    NotFound(PathBuf),

    #[error("Session at {} failed to parse: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Session at {} is corrupt or tampered (stored hash {stored}, computed {computed})", path.display())]
    HashMismatch {
        path: PathBuf,
        stored: String,
        computed: String,
    },

    #[error("Worktree session is pinned to {pinned}, not {requested}")]
    FeatureMismatch { pinned: String, requested: String },

    #[error("Session I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sentinel failures produced by the resilience toolkit itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    #[error("Circuit '{name}' is open; call rejected")]
    CircuitOpen { name: String },

    #[error("Gave up after {attempts} attempts; last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Failure of a call to an external tool (git, gh, opa, hooks, agent runner).
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("'{tool}' is not installed or not on PATH")]
    NotInstalled { tool: String },

    #[error("'{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("'{tool}' is unavailable: {message}")]
    Unavailable { tool: String, message: String },

    #[error("'{tool}' rejected the request: {message}")]
    Rejected { tool: String, message: String },

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl ExternalError {
    pub fn unavailable(tool: &str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn rejected(tool: &str, message: impl Into<String>) -> Self {
        Self::Rejected {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level error for the control plane.
#[derive(Debug, Error)]
pub enum SdpError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("Policy denied the transition: {}", denials.join("; "))]
    PolicyDenied {
        denials: Vec<String>,
        warnings: Vec<String>,
    },

    #[error("Hook blocked {event}: {message}")]
    HookBlocked { event: String, message: String },

    #[error("Not a usable working directory: {}", .0.display())]
    BadWorkingDir(PathBuf),
}

impl From<ResilienceError> for SdpError {
    fn from(err: ResilienceError) -> Self {
        SdpError::External(ExternalError::Resilience(err))
    }
}

impl SdpError {
    /// Classify this error for propagation and exit reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdpError::Checkpoint(CheckpointError::Io { .. }) => ErrorKind::Environment,
            SdpError::Checkpoint(CheckpointError::NotFound { .. }) => ErrorKind::Dependency,
            SdpError::Checkpoint(_) => ErrorKind::Protocol,
            SdpError::Phase(PhaseError::Blocked { .. }) => ErrorKind::Dependency,
            SdpError::Phase(_) => ErrorKind::Protocol,
            SdpError::Session(SessionError::Io { .. }) => ErrorKind::Environment,
            SdpError::Session(SessionError::NotFound(_)) => ErrorKind::Dependency,
            SdpError::Session(_) => ErrorKind::Protocol,
            SdpError::External(ExternalError::NotInstalled { .. }) => ErrorKind::Environment,
            SdpError::External(ExternalError::Rejected { .. }) => ErrorKind::Validation,
            SdpError::External(_) => ErrorKind::Runtime,
            SdpError::PolicyDenied { .. } | SdpError::HookBlocked { .. } => ErrorKind::Validation,
            SdpError::BadWorkingDir(_) => ErrorKind::Environment,
        }
    }

    /// Remediation hint shown next to the error, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SdpError::Checkpoint(CheckpointError::NotFound { .. }) => {
                Some("run without --resume to create the checkpoint")
            }
            SdpError::Checkpoint(CheckpointError::Corrupt { .. }) => {
                Some("inspect or remove the checkpoint file by hand; it is never rewritten automatically")
            }
            SdpError::Session(SessionError::HashMismatch { .. } | SessionError::Parse { .. }) => {
                Some("run `sdp session repair --feature <ID>` to recreate the session")
            }
            SdpError::Session(SessionError::NotFound(_)) => {
                Some("run `sdp session init --feature <ID>`")
            }
            SdpError::External(ExternalError::NotInstalled { .. }) => {
                Some("install the tool or put it on PATH")
            }
            SdpError::PolicyDenied { .. } => Some("fix the denials listed above and re-run"),
            SdpError::BadWorkingDir(_) => Some("pass --project-dir pointing at a git worktree"),
            _ => None,
        }
    }
}
