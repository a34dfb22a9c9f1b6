// Branch Coordinator
// Prepares and finalizes the per-run git branch. All git access goes through
// porcelain commands; the coordinator serializes its own invocations.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use cadence_types::{BranchStrategy, GitSettings};

use crate::error::{PipelineError, Result};

/// Branch prepared for a run.
#[derive(Debug, Clone)]
pub struct PreparedBranch {
    pub name: String,
    /// False when an existing branch was reused.
    pub created: bool,
}

/// Compute the run branch name. Reusable branches are shared across runs;
/// unique-per-run branches carry a short run id suffix.
pub fn branch_name_for(
    prefix: &str,
    pipeline: &str,
    run_id: &str,
    strategy: BranchStrategy,
) -> String {
    match strategy {
        BranchStrategy::Reusable => format!("{prefix}/{pipeline}"),
        BranchStrategy::UniquePerRun => {
            let short = &run_id[..run_id.len().min(8)];
            format!("{prefix}/{pipeline}/{short}")
        }
    }
}

pub struct BranchCoordinator {
    repo: PathBuf,
    remote: String,
    /// Serializes git invocations; concurrent stage tasks may commit.
    lock: tokio::sync::Mutex<()>,
}

impl BranchCoordinator {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            remote: "origin".to_string(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let _guard = self.lock.lock().await;
        self.git_unlocked(args).await
    }

    async fn git_unlocked(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PipelineError::Git(format!("failed to run git: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PipelineError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    async fn git_ok(&self, args: &[&str]) -> bool {
        self.git(args).await.is_ok()
    }

    /// Set up the run branch per the pipeline's git settings.
    pub async fn prepare(
        &self,
        pipeline: &str,
        run_id: &str,
        git: &GitSettings,
    ) -> Result<PreparedBranch> {
        // Best-effort fetch so origin/{base} is current.
        if let Err(e) = self.git(&["fetch", &self.remote]).await {
            tracing::warn!("fetch from {} failed, continuing: {}", self.remote, e);
        }

        let name = branch_name_for(&git.branch_prefix, pipeline, run_id, git.strategy);
        let local_ref = format!("refs/heads/{name}");
        let remote_base = format!("{}/{}", self.remote, git.base_branch);

        if self.git_ok(&["rev-parse", "--verify", &local_ref]).await {
            self.git(&["checkout", &name]).await?;
            if let Err(e) = self.git(&["merge", &remote_base]).await {
                tracing::warn!(
                    "merge of {} into {} failed, continuing on existing branch: {}",
                    remote_base,
                    name,
                    e
                );
                // leave a clean tree behind the warning
                let _ = self.git(&["merge", "--abort"]).await;
            }
            return Ok(PreparedBranch {
                name,
                created: false,
            });
        }

        if self
            .git_ok(&["checkout", "-b", &name, &remote_base])
            .await
        {
            return Ok(PreparedBranch {
                name,
                created: true,
            });
        }
        if self
            .git_ok(&["checkout", "-b", &name, &git.base_branch])
            .await
        {
            return Ok(PreparedBranch {
                name,
                created: true,
            });
        }

        Err(PipelineError::Setup(format!(
            "could not create branch '{}' from {} or local {}",
            name, remote_base, git.base_branch
        )))
    }

    pub async fn current_commit(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"]).await
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", branch]).await.map(|_| ())
    }

    /// Stage everything and commit. Returns the new commit sha, or `None`
    /// when the working tree had no changes. The whole sequence holds the
    /// git lock so concurrent stage commits cannot interleave.
    pub async fn commit(&self, message: &str, author: Option<&str>) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        self.git_unlocked(&["add", "-A"]).await?;

        let staged = self.git_unlocked(&["status", "--porcelain"]).await?;
        if staged.is_empty() {
            return Ok(None);
        }

        let mut args = vec!["commit", "-m", message];
        if let Some(author) = author {
            args.push("--author");
            args.push(author);
        }
        self.git_unlocked(&args).await?;
        self.git_unlocked(&["rev-parse", "HEAD"]).await.map(Some)
    }

    /// Files changed between two commits.
    pub async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{from}..{to}");
        let output = self.git(&["diff", "--name-only", &range]).await?;
        Ok(output
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn push(&self, branch: &str) -> Result<()> {
        self.git(&["push", "--set-upstream", &self.remote, branch])
            .await
            .map(|_| ())
    }

    pub async fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.git(&["branch", flag, branch]).await.map(|_| ())
    }

    /// Local branches under `{prefix}/`.
    pub async fn list_pipeline_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{prefix}/*");
        let output = self
            .git(&["branch", "--list", &pattern, "--format", "%(refname:short)"])
            .await?;
        Ok(output
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Remote branches under `{prefix}/` on `remote`, names without the
    /// remote qualifier.
    pub async fn list_remote_pipeline_branches(
        &self,
        prefix: &str,
        remote: &str,
    ) -> Result<Vec<String>> {
        let output = self.git(&["branch", "-r", "--format", "%(refname:short)"]).await?;
        let qualifier = format!("{remote}/");
        Ok(output
            .lines()
            .map(|l| l.trim())
            .filter_map(|l| l.strip_prefix(&qualifier))
            .filter(|l| l.starts_with(&format!("{prefix}/")))
            .map(|l| l.to_string())
            .collect())
    }

    pub async fn delete_remote(&self, branch: &str, remote: &str) -> Result<()> {
        self.git(&["push", remote, "--delete", branch])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::PullRequestSettings;
    use tempfile::TempDir;

    #[test]
    fn reusable_branch_name_has_no_run_suffix() {
        assert_eq!(
            branch_name_for("cadence", "review", "0123456789abcdef", BranchStrategy::Reusable),
            "cadence/review"
        );
    }

    #[test]
    fn unique_branch_name_uses_short_run_id() {
        assert_eq!(
            branch_name_for(
                "cadence",
                "review",
                "0123456789abcdef",
                BranchStrategy::UniquePerRun
            ),
            "cadence/review/01234567"
        );
    }

    #[test]
    fn short_run_ids_are_not_truncated() {
        assert_eq!(
            branch_name_for("cadence", "review", "abc", BranchStrategy::UniquePerRun),
            "cadence/review/abc"
        );
    }

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Fresh repo with one commit on `main` and no remote.
    async fn init_repo() -> (TempDir, BranchCoordinator) {
        let tmp = TempDir::new().unwrap();
        let coordinator = BranchCoordinator::new(tmp.path());
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "ci@example.com"],
            vec!["config", "user.name", "ci"],
        ] {
            coordinator.git(&args).await.unwrap();
        }
        std::fs::write(tmp.path().join("README.md"), "seed\n").unwrap();
        coordinator.git(&["add", "-A"]).await.unwrap();
        coordinator.git(&["commit", "-m", "seed"]).await.unwrap();
        (tmp, coordinator)
    }

    fn settings() -> GitSettings {
        GitSettings {
            base_branch: "main".to_string(),
            branch_prefix: "cadence".to_string(),
            strategy: BranchStrategy::Reusable,
            pull_request: PullRequestSettings::default(),
        }
    }

    #[tokio::test]
    async fn prepare_creates_branch_from_local_base_without_remote() {
        if !git_available().await {
            return;
        }
        let (_tmp, coordinator) = init_repo().await;

        let prepared = coordinator
            .prepare("review", "0123456789abcdef", &settings())
            .await
            .unwrap();
        assert_eq!(prepared.name, "cadence/review");
        assert!(prepared.created);

        // a second run reuses the branch
        let again = coordinator
            .prepare("review", "fedcba9876543210", &settings())
            .await
            .unwrap();
        assert!(!again.created);
    }

    #[tokio::test]
    async fn commit_returns_none_on_clean_tree() {
        if !git_available().await {
            return;
        }
        let (tmp, coordinator) = init_repo().await;

        assert!(coordinator.commit("noop", None).await.unwrap().is_none());

        std::fs::write(tmp.path().join("new.txt"), "content\n").unwrap();
        let sha = coordinator
            .commit("cadence(lint) 01234567: add file", None)
            .await
            .unwrap();
        assert!(sha.is_some());
    }

    #[tokio::test]
    async fn changed_files_lists_the_diff() {
        if !git_available().await {
            return;
        }
        let (tmp, coordinator) = init_repo().await;
        let initial = coordinator.current_commit().await.unwrap();

        std::fs::write(tmp.path().join("a.txt"), "a\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "b\n").unwrap();
        coordinator.commit("add files", None).await.unwrap();
        let head = coordinator.current_commit().await.unwrap();

        let mut files = coordinator.changed_files(&initial, &head).await.unwrap();
        files.sort();
        assert_eq!(files, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn list_pipeline_branches_filters_by_prefix() {
        if !git_available().await {
            return;
        }
        let (_tmp, coordinator) = init_repo().await;
        coordinator
            .prepare("review", "0123456789abcdef", &settings())
            .await
            .unwrap();
        coordinator.checkout("main").await.unwrap();

        let branches = coordinator.list_pipeline_branches("cadence").await.unwrap();
        assert_eq!(branches, vec!["cadence/review".to_string()]);
    }
}
