//! Single-step execution capabilities, one per step kind.
//!
//! The pipeline only knows these traits. [`StepRunners`] binds a runner to
//! every kind up front, so a missing kind is a construction error rather than
//! something discovered mid-pipeline.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::{Envs, ProjectCommandContext};
use crate::io::process::run_command_with_timeout;

/// Placeholder in tool arguments replaced by the absolute plan file path.
pub const PLANFILE_PLACEHOLDER: &str = "{planfile}";

/// Runs a built-in step (`init`, `plan`, `show`, `policy_check`, `apply`, `version`).
pub trait StepRunner: Send + Sync {
    fn run(
        &self,
        ctx: &ProjectCommandContext,
        extra_args: &[String],
        path: &Path,
        envs: &Envs,
    ) -> Result<String>;
}

/// Runs a custom `run` step.
pub trait CustomStepRunner: Send + Sync {
    fn run(
        &self,
        ctx: &ProjectCommandContext,
        command: &str,
        path: &Path,
        envs: &Envs,
    ) -> Result<String>;
}

/// Resolves the value of an `env` step. The returned string is stored, not displayed.
pub trait EnvStepRunner: Send + Sync {
    fn run(
        &self,
        ctx: &ProjectCommandContext,
        command: &str,
        value: &str,
        path: &Path,
        envs: &Envs,
    ) -> Result<String>;
}

/// One runner per step kind.
#[derive(Clone)]
pub struct StepRunners {
    pub init: Arc<dyn StepRunner>,
    pub plan: Arc<dyn StepRunner>,
    pub show: Arc<dyn StepRunner>,
    pub policy_check: Arc<dyn StepRunner>,
    pub apply: Arc<dyn StepRunner>,
    pub version: Arc<dyn StepRunner>,
    pub run: Arc<dyn CustomStepRunner>,
    pub env: Arc<dyn EnvStepRunner>,
}

/// Environment every step process receives before the accumulator is layered on top.
pub fn project_env(ctx: &ProjectCommandContext, path: &Path) -> Vec<(String, String)> {
    let planfile = path.join(ctx.plan_filename());
    [
        ("WORKSPACE", ctx.workspace.clone()),
        ("DIR", path.display().to_string()),
        ("PLANFILE", planfile.display().to_string()),
        ("BASE_REPO_NAME", ctx.pull.base_repo.name.clone()),
        ("BASE_REPO_OWNER", ctx.pull.base_repo.owner.clone()),
        ("HEAD_REPO_NAME", ctx.head_repo.name.clone()),
        ("HEAD_REPO_OWNER", ctx.head_repo.owner.clone()),
        ("HEAD_BRANCH_NAME", ctx.pull.head_branch.clone()),
        ("BASE_BRANCH_NAME", ctx.pull.base_branch.clone()),
        ("PROJECT_NAME", ctx.project_name.clone()),
        ("PULL_NUM", ctx.pull.num.to_string()),
        ("PULL_AUTHOR", ctx.pull.author.clone()),
        ("REPO_REL_DIR", ctx.repo_rel_dir.clone()),
        ("USER_NAME", ctx.user.username.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn apply_env(cmd: &mut Command, ctx: &ProjectCommandContext, path: &Path, envs: &Envs) {
    cmd.envs(project_env(ctx, path));
    cmd.envs(envs);
}

/// Runs a fixed binary (e.g. `terraform`) with base arguments followed by the step's extra args.
#[derive(Debug, Clone)]
pub struct ToolStepRunner {
    pub binary: String,
    /// Base arguments; [`PLANFILE_PLACEHOLDER`] is replaced with the plan file path.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl StepRunner for ToolStepRunner {
    #[instrument(skip_all, fields(binary = %self.binary))]
    fn run(
        &self,
        ctx: &ProjectCommandContext,
        extra_args: &[String],
        path: &Path,
        envs: &Envs,
    ) -> Result<String> {
        let planfile = path.join(ctx.plan_filename()).display().to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(PLANFILE_PLACEHOLDER, &planfile))
            .chain(extra_args.iter().cloned())
            .collect();
        debug!(args = ?args, "running tool step");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args).current_dir(path);
        apply_env(&mut cmd, ctx, path, envs);

        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {}", self.binary))?;
        let text = output.combined();
        if output.timed_out {
            return Err(anyhow!(
                "{} {} timed out after {:?}",
                self.binary,
                args.join(" "),
                self.timeout
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "running {} {} in {}: {}\n{}",
                self.binary,
                args.join(" "),
                path.display(),
                output.status,
                text
            ));
        }
        Ok(text)
    }
}

/// Runs a `run` step's command through a shell.
#[derive(Debug, Clone)]
pub struct RunStepRunner {
    pub shell: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CustomStepRunner for RunStepRunner {
    #[instrument(skip_all, fields(command = %command))]
    fn run(
        &self,
        ctx: &ProjectCommandContext,
        command: &str,
        path: &Path,
        envs: &Envs,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).current_dir(path);
        apply_env(&mut cmd, ctx, path, envs);

        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {command:?}"))?;
        let text = output.combined();
        if output.timed_out {
            return Err(anyhow!(
                "running {command:?} in {:?}: timed out after {:?}",
                path.display().to_string(),
                self.timeout
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "{}: running {command:?} in {:?}: \n{text}",
                output.status,
                path.display().to_string()
            ));
        }
        Ok(text)
    }
}

/// Resolves `env` steps: a static value wins, otherwise the trimmed output of the command.
#[derive(Debug, Clone)]
pub struct DefaultEnvStepRunner {
    pub run_step: RunStepRunner,
}

impl EnvStepRunner for DefaultEnvStepRunner {
    fn run(
        &self,
        ctx: &ProjectCommandContext,
        command: &str,
        value: &str,
        path: &Path,
        envs: &Envs,
    ) -> Result<String> {
        if !value.is_empty() {
            return Ok(value.to_string());
        }
        let out = self.run_step.run(ctx, command, path, envs)?;
        Ok(out.trim().to_string())
    }
}
