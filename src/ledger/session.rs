//! Per-worktree session identity.
//!
//! The session pins a worktree to one feature, branch and remote. Its `hash`
//! is the SHA-256 of the canonical JSON of every other field, so any edit to
//! the file on disk is detected on the next load.

use crate::errors::{SdpError, SessionError};
use crate::resilience::Guard;
use crate::tracker::Vcs;
use crate::util::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const SESSION_VERSION: u32 = 1;
pub const SESSION_FILE: &str = ".sdp/session.json";

pub fn session_path(project_dir: &Path) -> PathBuf {
    project_dir.join(SESSION_FILE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub version: u32,
    pub worktree_path: String,
    pub feature_id: String,
    pub expected_branch: String,
    pub expected_remote: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub hash: String,
}

/// Every field except `hash`, in fixed declaration order. Struct fields
/// serialize in order; a map would not.
#[derive(Serialize)]
struct Canonical<'a> {
    version: u32,
    worktree_path: &'a str,
    feature_id: &'a str,
    expected_branch: &'a str,
    expected_remote: &'a str,
    created_at: &'a DateTime<Utc>,
    created_by: &'a str,
}

/// One way the live worktree differs from the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drift {
    pub field: &'static str,
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} is '{}' but session expects '{}'",
            self.field, self.actual, self.expected
        )
    }
}

impl Session {
    /// Build a new session. Branch and remote start empty; `repair` and
    /// `sync` fill them from git.
    pub fn init(feature_id: &str, worktree_path: &Path, created_by: &str) -> Self {
        let mut session = Self {
            version: SESSION_VERSION,
            worktree_path: worktree_path.to_string_lossy().to_string(),
            feature_id: feature_id.to_string(),
            expected_branch: String::new(),
            expected_remote: String::new(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            hash: String::new(),
        };
        session.hash = session.compute_hash();
        session
    }

    pub fn compute_hash(&self) -> String {
        let canonical = Canonical {
            version: self.version,
            worktree_path: &self.worktree_path,
            feature_id: &self.feature_id,
            expected_branch: &self.expected_branch,
            expected_remote: &self.expected_remote,
            created_at: &self.created_at,
            created_by: &self.created_by,
        };
        // Serializing a struct of strings and a timestamp cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        !self.hash.is_empty() && self.hash == self.compute_hash()
    }

    /// Read and verify the session for `project_dir`.
    pub fn load(project_dir: &Path) -> Result<Self, SessionError> {
        let path = session_path(project_dir);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(SessionError::NotFound(path)),
            Err(source) => return Err(SessionError::Io { path, source }),
        };
        let session: Session = serde_json::from_str(&content).map_err(|source| SessionError::Parse {
            path: path.clone(),
            source,
        })?;
        let computed = session.compute_hash();
        if session.hash != computed {
            return Err(SessionError::HashMismatch {
                path,
                stored: session.hash,
                computed,
            });
        }
        Ok(session)
    }

    /// Load, mapping a missing file to `None`.
    pub fn load_optional(project_dir: &Path) -> Result<Option<Self>, SessionError> {
        match Self::load(project_dir) {
            Ok(s) => Ok(Some(s)),
            Err(SessionError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Recompute the hash and persist atomically.
    pub fn save(&mut self, project_dir: &Path) -> Result<(), SessionError> {
        self.hash = self.compute_hash();
        let path = session_path(project_dir);
        write_json_atomic(&path, self).map_err(|source| SessionError::Io { path, source })
    }

    /// Fresh session with branch and remote taken from git, overwriting
    /// whatever is on disk. The designated recovery path for a corrupt file.
    pub async fn repair(
        project_dir: &Path,
        feature_id: &str,
        created_by: &str,
        vcs: &dyn Vcs,
        git: Guard<'_>,
    ) -> Result<Self, SdpError> {
        let mut session = Self::init(feature_id, vcs.worktree_path(), created_by);
        session.expected_branch = git.call(|| vcs.current_branch()).await?;
        session.expected_remote = git.call(|| vcs.remote_url()).await?.unwrap_or_default();
        session.save(project_dir)?;
        tracing::info!(feature = feature_id, branch = %session.expected_branch, "session repaired");
        Ok(session)
    }

    /// Compare the session against live git state without writing.
    pub async fn check_worktree(
        &self,
        vcs: &dyn Vcs,
        git: Guard<'_>,
    ) -> Result<Vec<Drift>, SdpError> {
        let mut drift = Vec::new();
        let branch = git.call(|| vcs.current_branch()).await?;
        if branch != self.expected_branch {
            drift.push(Drift {
                field: "branch",
                expected: self.expected_branch.clone(),
                actual: branch,
            });
        }
        let remote = git.call(|| vcs.remote_url()).await?.unwrap_or_default();
        if remote != self.expected_remote {
            drift.push(Drift {
                field: "remote",
                expected: self.expected_remote.clone(),
                actual: remote,
            });
        }
        Ok(drift)
    }

    /// Adopt live branch/remote and re-save. Returns what changed.
    pub async fn sync(
        &mut self,
        project_dir: &Path,
        vcs: &dyn Vcs,
        git: Guard<'_>,
    ) -> Result<Vec<Drift>, SdpError> {
        let drift = self.check_worktree(vcs, git).await?;
        for d in &drift {
            match d.field {
                "branch" => self.expected_branch = d.actual.clone(),
                "remote" => self.expected_remote = d.actual.clone(),
                _ => {}
            }
        }
        if !drift.is_empty() {
            self.save(project_dir)?;
            tracing::info!(changes = drift.len(), "session synced with worktree");
        }
        Ok(drift)
    }
}

/// Who is recording: `$USER`, falling back to `sdp`.
pub fn default_actor() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "sdp".to_string())
}
