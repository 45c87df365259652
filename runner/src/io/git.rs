//! Git adapter for working-directory checkouts.
//!
//! Checkouts are driven through a small, explicit wrapper around `git`
//! subprocess calls so every invocation is logged and its stderr surfaces in
//! the returned error.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Identity used for merge commits created during a merge checkout.
const MERGE_USER_NAME: &str = "project-runner";
const MERGE_USER_EMAIL: &str = "project-runner@localhost";

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Clone a single branch of `url` into `dest`.
    #[instrument(skip_all, fields(branch = %branch, dest = %dest.display()))]
    pub fn clone_branch(&self, url: &str, branch: &str, dest: &Path, shallow: bool) -> Result<()> {
        let dest = dest.to_string_lossy();
        let mut args = vec!["clone", "--branch", branch, "--single-branch"];
        if shallow {
            args.push("--depth=1");
        }
        args.push(url);
        args.push(&dest);
        debug!("cloning branch");
        self.run_checked(&args)?;
        Ok(())
    }

    /// Resolve a revision (e.g. `HEAD`, `HEAD^2`) to a full sha.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", rev])?;
        Ok(out.trim().to_string())
    }

    /// Fetch `branch` from `url` into `FETCH_HEAD`.
    pub fn fetch_branch(&self, url: &str, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{branch}:");
        self.run_checked(&["fetch", url, &refspec])?;
        Ok(())
    }

    /// Merge `rev` into the current branch with a merge commit.
    #[instrument(skip_all, fields(rev = %rev))]
    pub fn merge_no_ff(&self, rev: &str, message: &str) -> Result<()> {
        self.run_checked(&["config", "--local", "user.name", MERGE_USER_NAME])?;
        self.run_checked(&["config", "--local", "user.email", MERGE_USER_EMAIL])?;
        self.run_checked(&["merge", "-q", "--no-ff", "-m", message, rev])?;
        Ok(())
    }

    /// Refresh remote-tracking branches.
    pub fn remote_update(&self) -> Result<()> {
        self.run_checked(&["remote", "update"])?;
        Ok(())
    }

    /// First line of `git status --branch --porcelain`, e.g. `## main...origin/main [behind 1]`.
    pub fn branch_status(&self) -> Result<String> {
        let out = self.run_capture(&["status", "--untracked-files=no", "--branch", "--porcelain"])?;
        Ok(out.lines().next().unwrap_or_default().to_string())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// True if a `## branch...upstream [..]` status line reports the branch behind its upstream.
pub fn is_behind_upstream(status_line: &str) -> bool {
    let Some(tracking) = status_line
        .split_once('[')
        .and_then(|(_, rest)| rest.split_once(']'))
        .map(|(inner, _)| inner)
    else {
        return false;
    };
    tracking
        .split(',')
        .any(|part| part.trim().starts_with("behind "))
}
