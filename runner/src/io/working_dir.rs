//! Working-directory management: where a pull request's checkout lives.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::error::WorkingDirError;
use crate::core::types::{PullRequest, Repo};
use crate::io::git::{Git, is_behind_upstream};

/// Result of a clone-or-reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    /// Absolute path to the checkout root.
    pub path: PathBuf,
    /// Whether the base branch moved since the checkout was last synced.
    pub has_diverged: bool,
}

/// Owns the durable checkout for each `(repo, pull, workspace)`.
pub trait WorkingDir: Send + Sync {
    /// Clone the pull request, or reuse an existing checkout of the same head commit.
    fn clone_or_reuse(
        &self,
        head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<CloneOutcome>;

    /// Path of an existing checkout. Fails with [`WorkingDirError::NotExist`] if none was made.
    fn get_working_dir(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf, WorkingDirError>;

    /// Whether the base branch moved since the checkout at `path` was synced.
    fn has_diverged(&self, path: &Path) -> bool;

    /// Remove every checkout for the pull request.
    fn delete(&self, repo: &Repo, pull: &PullRequest) -> Result<()>;
}

/// How a pull request is materialized on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStrategy {
    /// Check out the head branch as-is.
    #[default]
    Branch,
    /// Check out the base branch and merge the head branch into it.
    Merge,
}

/// Checkouts under `<data_dir>/repos/<repo>/<pull>/<workspace>`, managed with `git`.
#[derive(Debug, Clone)]
pub struct FileWorkspace {
    data_dir: PathBuf,
    strategy: CheckoutStrategy,
}

impl FileWorkspace {
    pub fn new(data_dir: impl Into<PathBuf>, strategy: CheckoutStrategy) -> Self {
        Self {
            data_dir: data_dir.into(),
            strategy,
        }
    }

    fn repo_pull_dir(&self, repo: &Repo, pull: &PullRequest) -> Result<PathBuf> {
        let name = Path::new(&repo.full_name);
        let relative = name
            .components()
            .all(|part| matches!(part, Component::Normal(_)));
        if repo.full_name.is_empty() || !relative {
            bail!("repository name {:?} is not a relative path", repo.full_name);
        }
        Ok(self
            .data_dir
            .join("repos")
            .join(name)
            .join(pull.num.to_string()))
    }

    /// Checkout dir for one workspace. Always a direct child of the pull's dir.
    fn clone_dir(&self, repo: &Repo, pull: &PullRequest, workspace: &str) -> Result<PathBuf> {
        if !is_single_name(workspace) {
            bail!("workspace {workspace:?} is not a single path segment");
        }
        Ok(self.repo_pull_dir(repo, pull)?.join(workspace))
    }

    /// Sha of the pull request head as checked out under `dir`.
    fn checked_out_head(&self, dir: &Path) -> Result<String> {
        let git = Git::new(dir);
        match self.strategy {
            CheckoutStrategy::Branch => git.rev_parse("HEAD"),
            // The head commit is the second parent of the merge commit.
            CheckoutStrategy::Merge => git.rev_parse("HEAD^2"),
        }
    }

    #[instrument(skip_all, fields(dir = %dir.display()))]
    fn force_clone(&self, head_repo: &Repo, pull: &PullRequest, dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        let parent = dir
            .parent()
            .with_context(|| format!("clone dir missing parent {}", dir.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

        let git = Git::new(parent);
        match self.strategy {
            CheckoutStrategy::Branch => {
                info!(branch = %pull.head_branch, "cloning head branch");
                git.clone_branch(&head_repo.clone_url, &pull.head_branch, dir, true)?;
            }
            CheckoutStrategy::Merge => {
                info!(
                    base = %pull.base_branch,
                    head = %pull.head_branch,
                    "cloning base branch and merging head"
                );
                git.clone_branch(&pull.base_repo.clone_url, &pull.base_branch, dir, false)?;
                let checkout = Git::new(dir);
                checkout.fetch_branch(&head_repo.clone_url, &pull.head_branch)?;
                checkout.merge_no_ff("FETCH_HEAD", "project-runner-merge")?;
            }
        }
        Ok(())
    }
}

impl WorkingDir for FileWorkspace {
    #[instrument(skip_all, fields(repo = %pull.base_repo.full_name, pull = pull.num, workspace = %workspace))]
    fn clone_or_reuse(
        &self,
        head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<CloneOutcome> {
        let dir = self.clone_dir(&pull.base_repo, pull, workspace)?;

        if dir.exists() {
            match self.checked_out_head(&dir) {
                Ok(sha) if sha == pull.head_commit => {
                    debug!("reusing checkout at head commit");
                    let has_diverged =
                        self.strategy == CheckoutStrategy::Merge && self.has_diverged(&dir);
                    return Ok(CloneOutcome {
                        path: dir,
                        has_diverged,
                    });
                }
                Ok(sha) => {
                    debug!(checked_out = %sha, head = %pull.head_commit, "checkout is stale, recloning");
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "cannot read checkout head, recloning");
                }
            }
        }

        self.force_clone(head_repo, pull, &dir)?;
        Ok(CloneOutcome {
            path: dir,
            has_diverged: false,
        })
    }

    fn get_working_dir(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf, WorkingDirError> {
        let dir = self
            .clone_dir(repo, pull, workspace)
            .map_err(WorkingDirError::Other)?;
        match fs::metadata(&dir) {
            Ok(_) => Ok(dir),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkingDirError::NotExist(dir))
            }
            Err(err) => Err(WorkingDirError::Other(
                anyhow::Error::new(err).context(format!("stat {}", dir.display())),
            )),
        }
    }

    fn has_diverged(&self, path: &Path) -> bool {
        let git = Git::new(path);
        if let Err(err) = git.remote_update() {
            warn!(err = %format!("{err:#}"), "remote update failed, assuming not diverged");
            return false;
        }
        match git.branch_status() {
            Ok(line) => is_behind_upstream(&line),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "git status failed, assuming not diverged");
                false
            }
        }
    }

    fn delete(&self, repo: &Repo, pull: &PullRequest) -> Result<()> {
        let dir = self.repo_pull_dir(repo, pull)?;
        if !dir.exists() {
            return Ok(());
        }
        debug!(dir = %dir.display(), "deleting pull checkouts");
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
    }
}

/// Whether `name` is exactly one normal path component.
pub(crate) fn is_single_name(name: &str) -> bool {
    let mut parts = Path::new(name).components();
    matches!(
        (parts.next(), parts.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}
