use super::Vcs;
use crate::errors::ExternalError;
use crate::process::{ToolCommand, run_tool};
use crate::resolver::CiStatus;
use async_trait::async_trait;
use git2::{Delta, DiffOptions, Repository};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Production [`Vcs`]: libgit2 for the worktree, `gh` for GitHub.
#[derive(Debug, Clone)]
pub struct GitCli {
    project_dir: PathBuf,
    gh_program: String,
    timeout: Duration,
}

impl GitCli {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            gh_program: "gh".to_string(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_gh_program(mut self, program: impl Into<String>) -> Self {
        self.gh_program = program.into();
        self
    }

    /// Run a read-only libgit2 query off the async runtime.
    async fn with_repo<T, F>(&self, f: F) -> Result<T, ExternalError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, git2::Error> + Send + 'static,
    {
        let dir = self.project_dir.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::discover(&dir)?;
            f(&repo)
        })
        .await
        .map_err(|e| ExternalError::unavailable("git", format!("git task failed: {}", e)))?
        .map_err(|e| ExternalError::rejected("git", e.message().to_string()))
    }

    async fn gh(&self, args: &[&str]) -> Result<crate::process::ToolOutput, ExternalError> {
        let cmd = ToolCommand::new(&self.gh_program)
            .args(args.iter().copied())
            .current_dir(&self.project_dir)
            .timeout(self.timeout);
        run_tool(&cmd).await
    }
}

fn changed_paths(repo: &Repository) -> Result<Vec<String>, git2::Error> {
    let head_tree = match repo.head() {
        Ok(head) => Some(head.peel_to_tree()?),
        // Unborn branch: everything in the worktree is new.
        Err(_) => None,
    };

    let mut opts = DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let diff = repo.diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;

    let mut files = Vec::new();
    for delta in diff.deltas() {
        let path = match delta.status() {
            Delta::Deleted => delta.old_file().path(),
            Delta::Added
            | Delta::Untracked
            | Delta::Modified
            | Delta::Renamed
            | Delta::Copied
            | Delta::Typechange => delta.new_file().path(),
            _ => None,
        };
        if let Some(path) = path {
            files.push(path.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

#[derive(Debug, Deserialize)]
struct PrView {
    number: u64,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct Check {
    #[serde(default)]
    bucket: String,
}

/// Fold `gh pr checks --json bucket` output into one status.
fn summarize_checks(checks: &[Check]) -> CiStatus {
    if checks.is_empty() {
        return CiStatus::Pending;
    }
    if checks
        .iter()
        .any(|c| matches!(c.bucket.as_str(), "fail" | "cancel"))
    {
        return CiStatus::Red;
    }
    if checks.iter().any(|c| c.bucket == "pending") {
        return CiStatus::Pending;
    }
    CiStatus::Green
}

#[async_trait]
impl Vcs for GitCli {
    fn worktree_path(&self) -> &Path {
        &self.project_dir
    }

    async fn current_branch(&self) -> Result<String, ExternalError> {
        self.with_repo(|repo| {
            let head = repo.head()?;
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        })
        .await
    }

    async fn remote_url(&self) -> Result<Option<String>, ExternalError> {
        self.with_repo(|repo| match repo.find_remote("origin") {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn changed_files(&self) -> Result<Vec<String>, ExternalError> {
        self.with_repo(changed_paths).await
    }

    async fn open_pr(&self, branch: &str) -> Result<Option<u64>, ExternalError> {
        let out = self
            .gh(&["pr", "view", branch, "--json", "number,state"])
            .await?;
        if !out.success() {
            let stderr = out.stderr.to_lowercase();
            if stderr.contains("no pull requests found") || stderr.contains("no open pull requests") {
                return Ok(None);
            }
            return Err(ExternalError::unavailable("gh", out.stderr.trim()));
        }
        let view: PrView = serde_json::from_str(out.stdout.trim())
            .map_err(|e| ExternalError::rejected("gh", format!("unexpected pr view output: {}", e)))?;
        Ok((view.state.is_empty() || view.state.eq_ignore_ascii_case("open")).then_some(view.number))
    }

    async fn ci_status(&self, pr_number: u64) -> Result<CiStatus, ExternalError> {
        let pr = pr_number.to_string();
        let out = self.gh(&["pr", "checks", &pr, "--json", "bucket"]).await?;
        // `gh pr checks` exits 8 while checks are pending and 1 when some
        // failed, but still prints the JSON.
        let checks: Vec<Check> = match serde_json::from_str(out.stdout.trim()) {
            Ok(checks) => checks,
            Err(_) if out.stderr.to_lowercase().contains("no checks") => Vec::new(),
            Err(e) => {
                return Err(ExternalError::unavailable(
                    "gh",
                    format!("unexpected pr checks output: {}", e),
                ));
            }
        };
        Ok(summarize_checks(&checks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        fs::write(dir.join("README.md"), "hello\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("sdp", "sdp@localhost").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_branch_remote_and_changes() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        repo.remote("origin", "https://github.com/acme/widgets.git")
            .unwrap();
        fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/new.rs"), "fn main() {}\n").unwrap();

        let git = GitCli::new(dir.path());
        let branch = git.current_branch().await.unwrap();
        assert!(branch == "master" || branch == "main");
        assert_eq!(
            git.remote_url().await.unwrap().as_deref(),
            Some("https://github.com/acme/widgets.git")
        );
        assert_eq!(
            git.changed_files().await.unwrap(),
            vec!["README.md".to_string(), "src/new.rs".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_remote_is_none() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        assert!(GitCli::new(dir.path()).remote_url().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_not_a_repo_is_rejected() {
        let dir = tempdir().unwrap();
        let err = GitCli::new(dir.path()).current_branch().await.unwrap_err();
        assert!(matches!(err, ExternalError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_missing_gh_is_not_installed() {
        let dir = tempdir().unwrap();
        let git = GitCli::new(dir.path()).with_gh_program("sdp-no-such-gh");
        assert!(matches!(
            git.open_pr("main").await,
            Err(ExternalError::NotInstalled { .. })
        ));
    }

    #[test]
    fn test_summarize_checks() {
        let checks = |b: &[&str]| -> Vec<Check> {
            b.iter()
                .map(|s| Check {
                    bucket: s.to_string(),
                })
                .collect()
        };
        assert_eq!(summarize_checks(&checks(&[])), CiStatus::Pending);
        assert_eq!(summarize_checks(&checks(&["pass", "skipping"])), CiStatus::Green);
        assert_eq!(summarize_checks(&checks(&["pass", "pending"])), CiStatus::Pending);
        assert_eq!(summarize_checks(&checks(&["pending", "fail"])), CiStatus::Red);
    }
}
