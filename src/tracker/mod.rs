//! Version-control facts.
//!
//! [`Vcs`] is the narrow seam between the engine and git/GitHub. [`GitCli`]
//! is the production adapter (libgit2 for local state, `gh` for pull
//! requests and checks); [`FakeVcs`] is an in-memory stand-in.

pub mod git;

pub use git::GitCli;

use crate::errors::ExternalError;
use crate::resolver::CiStatus;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Root of the worktree this adapter reads.
    fn worktree_path(&self) -> &Path;

    async fn current_branch(&self) -> Result<String, ExternalError>;

    /// URL of the `origin` remote, if configured.
    async fn remote_url(&self) -> Result<Option<String>, ExternalError>;

    /// Paths (relative to the worktree) changed against HEAD, untracked
    /// files included.
    async fn changed_files(&self) -> Result<Vec<String>, ExternalError>;

    /// Number of the open pull request for `branch`, if any.
    async fn open_pr(&self, branch: &str) -> Result<Option<u64>, ExternalError>;

    async fn ci_status(&self, pr_number: u64) -> Result<CiStatus, ExternalError>;
}

/// Scriptable in-memory [`Vcs`].
#[derive(Debug, Default)]
pub struct FakeVcs {
    pub path: PathBuf,
    pub branch: Mutex<String>,
    pub remote: Mutex<Option<String>>,
    pub changed: Mutex<Vec<String>>,
    pub pr: Mutex<Option<u64>>,
    pub ci: Mutex<Option<CiStatus>>,
    /// When set, GitHub queries fail as if `gh` were missing.
    pub gh_missing: bool,
    /// Remaining local git reads that fail as temporarily unavailable.
    pub git_failures: AtomicU32,
}

impl FakeVcs {
    pub fn new(path: impl Into<PathBuf>, branch: &str) -> Self {
        Self {
            path: path.into(),
            branch: Mutex::new(branch.to_string()),
            ..Default::default()
        }
    }

    pub fn set_branch(&self, branch: &str) {
        *self.branch.lock().unwrap_or_else(|e| e.into_inner()) = branch.to_string();
    }

    pub fn set_remote(&self, remote: Option<&str>) {
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = remote.map(str::to_string);
    }

    pub fn set_changed(&self, files: &[&str]) {
        *self.changed.lock().unwrap_or_else(|e| e.into_inner()) =
            files.iter().map(|f| f.to_string()).collect();
    }

    pub fn set_pr(&self, pr: Option<u64>) {
        *self.pr.lock().unwrap_or_else(|e| e.into_inner()) = pr;
    }

    pub fn set_ci(&self, ci: Option<CiStatus>) {
        *self.ci.lock().unwrap_or_else(|e| e.into_inner()) = ci;
    }

    /// Make the next `n` local git reads fail with a retryable error.
    pub fn fail_git(&self, n: u32) {
        self.git_failures.store(n, Ordering::SeqCst);
    }

    fn take_git_failure(&self) -> Result<(), ExternalError> {
        let failing = self
            .git_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExternalError::unavailable("git", "index.lock exists"));
        }
        Ok(())
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    fn worktree_path(&self) -> &Path {
        &self.path
    }

    async fn current_branch(&self) -> Result<String, ExternalError> {
        self.take_git_failure()?;
        Ok(self.branch.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn remote_url(&self) -> Result<Option<String>, ExternalError> {
        self.take_git_failure()?;
        Ok(self.remote.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn changed_files(&self) -> Result<Vec<String>, ExternalError> {
        self.take_git_failure()?;
        Ok(self.changed.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn open_pr(&self, _branch: &str) -> Result<Option<u64>, ExternalError> {
        if self.gh_missing {
            return Err(ExternalError::NotInstalled { tool: "gh".into() });
        }
        Ok(*self.pr.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn ci_status(&self, _pr_number: u64) -> Result<CiStatus, ExternalError> {
        if self.gh_missing {
            return Err(ExternalError::NotInstalled { tool: "gh".into() });
        }
        Ok(self
            .ci
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(CiStatus::Pending))
    }
}
