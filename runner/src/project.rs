//! Per-project command flows: plan, policy check, apply, approve policies, version.
//!
//! Every flow returns a [`ProjectResult`]; nothing here panics or propagates
//! errors to the caller. System faults land in [`Outcome::Error`], business
//! rejections in [`Outcome::Failure`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::core::error::ProjectError;
use crate::core::result::{CommandName, Outcome, PlanSuccess, PolicyCheckSuccess, ProjectResult};
use crate::core::types::ProjectCommandContext;
use crate::io::apply_requirements::ApplyRequirement;
use crate::io::locker::{WorkingDirLock, WorkingDirLocker};
use crate::io::step_runners::StepRunners;
use crate::io::webhooks::{ApplyResult, WebhooksSender};
use crate::io::working_dir::WorkingDir;
use crate::locking::{LockUrlGenerator, ProjectCommandLocker, ProjectLocker};
use crate::pipeline::run_steps;

/// Output returned by approve-policies.
pub const POLICIES_APPROVED: &str = "Policies approved";

/// Runs project commands.
pub trait ProjectCommandRunner: Send + Sync {
    fn plan(&self, ctx: &ProjectCommandContext) -> ProjectResult;
    fn policy_check(&self, ctx: &ProjectCommandContext) -> ProjectResult;
    fn apply(&self, ctx: &ProjectCommandContext) -> ProjectResult;
    fn approve_policies(&self, ctx: &ProjectCommandContext) -> ProjectResult;
    fn version(&self, ctx: &ProjectCommandContext) -> ProjectResult;
}

/// Runner wired to concrete collaborators.
#[derive(Clone)]
pub struct DefaultProjectCommandRunner {
    steps: StepRunners,
    working_dir: Arc<dyn WorkingDir>,
    working_dir_locker: Arc<dyn WorkingDirLocker>,
    webhooks: Arc<dyn WebhooksSender>,
    apply_requirements: Arc<dyn ApplyRequirement>,
}

enum ApplyOutcome {
    Applied(String),
    Rejected(String),
}

impl DefaultProjectCommandRunner {
    pub fn new(
        steps: StepRunners,
        working_dir: Arc<dyn WorkingDir>,
        working_dir_locker: Arc<dyn WorkingDirLocker>,
        webhooks: Arc<dyn WebhooksSender>,
        apply_requirements: Arc<dyn ApplyRequirement>,
    ) -> Self {
        Self {
            steps,
            working_dir,
            working_dir_locker,
            webhooks,
            apply_requirements,
        }
    }

    /// Wrap this runner so each command also takes the pull-request project lock.
    pub fn with_locking(
        self,
        locker: Arc<dyn ProjectLocker>,
        lock_url_generator: Arc<dyn LockUrlGenerator>,
    ) -> ProjectCommandLocker<Self> {
        ProjectCommandLocker::new(self, locker, lock_url_generator)
    }

    fn lock(&self, ctx: &ProjectCommandContext) -> Result<WorkingDirLock, ProjectError> {
        let lock = self.working_dir_locker.try_lock(
            &ctx.pull.base_repo.full_name,
            ctx.pull.num,
            &ctx.workspace,
        )?;
        Ok(lock)
    }

    /// Existing checkout for the pull request; never clones.
    fn existing_working_dir(&self, ctx: &ProjectCommandContext) -> Result<PathBuf, ProjectError> {
        let dir = self
            .working_dir
            .get_working_dir(&ctx.pull.base_repo, &ctx.pull, &ctx.workspace)?;
        Ok(dir)
    }

    fn run_pipeline(
        &self,
        ctx: &ProjectCommandContext,
        project_dir: &Path,
    ) -> Result<String, ProjectError> {
        run_steps(&self.steps, &ctx.steps, ctx, project_dir)
            .map(|outputs| outputs.join("\n"))
            .map_err(|err| ProjectError::StepFailed {
                output: err.joined_outputs(),
                source: err.source,
            })
    }

    fn do_plan(&self, ctx: &ProjectCommandContext) -> Result<PlanSuccess, ProjectError> {
        let _lock = self.lock(ctx)?;

        let cloned = self
            .working_dir
            .clone_or_reuse(&ctx.head_repo, &ctx.pull, &ctx.workspace)
            .map_err(ProjectError::WorkingDir)?;
        let project_dir = project_dir(&cloned.path, ctx)?;

        let output = self.run_pipeline(ctx, &project_dir)?;
        Ok(PlanSuccess {
            output,
            lock_url: None,
            replan_cmd: ctx.replan_cmd.clone(),
            apply_cmd: ctx.apply_cmd.clone(),
            has_diverged: cloned.has_diverged,
        })
    }

    fn do_policy_check(
        &self,
        ctx: &ProjectCommandContext,
    ) -> Result<PolicyCheckSuccess, ProjectError> {
        let _lock = self.lock(ctx)?;

        // Reuse the plan's checkout; the pull may have moved since.
        let repo_dir = self.existing_working_dir(ctx)?;
        let project_dir = project_dir(&repo_dir, ctx)?;

        let output = self.run_pipeline(ctx, &project_dir)?;
        Ok(PolicyCheckSuccess {
            output,
            lock_url: None,
            replan_cmd: ctx.replan_cmd.clone(),
            apply_cmd: ctx.apply_cmd.clone(),
            // Not tracked for policy checks.
            has_diverged: false,
        })
    }

    fn do_apply(&self, ctx: &ProjectCommandContext) -> Result<ApplyOutcome, ProjectError> {
        let repo_dir = self.existing_working_dir(ctx)?;
        let project_dir = project_dir(&repo_dir, ctx)?;

        let _lock = self.lock(ctx)?;

        let rejection = self
            .apply_requirements
            .validate_project(&repo_dir, ctx)
            .map_err(ProjectError::ApplyRequirements)?;
        if let Some(reason) = rejection {
            info!(%reason, "apply rejected");
            return Ok(ApplyOutcome::Rejected(reason));
        }

        let result = self.run_pipeline(ctx, &project_dir);
        self.notify_applied(ctx, result.is_ok());
        result.map(ApplyOutcome::Applied)
    }

    fn do_version(&self, ctx: &ProjectCommandContext) -> Result<String, ProjectError> {
        let repo_dir = self.existing_working_dir(ctx)?;
        let project_dir = project_dir(&repo_dir, ctx)?;

        let _lock = self.lock(ctx)?;
        self.run_pipeline(ctx, &project_dir)
    }

    fn notify_applied(&self, ctx: &ProjectCommandContext, success: bool) {
        let result = ApplyResult {
            workspace: ctx.workspace.clone(),
            user: ctx.user.clone(),
            repo: ctx.pull.base_repo.clone(),
            pull: ctx.pull.clone(),
            success,
            directory: ctx.repo_rel_dir.clone(),
        };
        if let Err(err) = self.webhooks.send(&result) {
            warn!(err = %format!("{err:#}"), "sending apply webhook failed");
        }
    }
}

/// Absolute project directory inside `repo_dir`, which must exist.
fn project_dir(repo_dir: &Path, ctx: &ProjectCommandContext) -> Result<PathBuf, ProjectError> {
    let inside = Path::new(&ctx.repo_rel_dir)
        .components()
        .all(|part| matches!(part, Component::Normal(_) | Component::CurDir));
    if !inside {
        return Err(ProjectError::WorkingDir(anyhow!(
            "dir {:?} is outside the checkout",
            ctx.repo_rel_dir
        )));
    }
    let dir = repo_dir.join(&ctx.repo_rel_dir);
    match fs::metadata(&dir) {
        Ok(_) => Ok(dir),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(ProjectError::ProjectDirMissing {
            repo_rel_dir: ctx.repo_rel_dir.clone(),
        }),
        Err(err) => Err(ProjectError::WorkingDir(
            anyhow::Error::new(err).context(format!("stat {}", dir.display())),
        )),
    }
}

fn outcome_of<T>(result: Result<T, ProjectError>, success: impl FnOnce(T) -> Outcome) -> Outcome {
    match result {
        Ok(payload) => success(payload),
        Err(err) => {
            debug!(err = %err, "project command errored");
            Outcome::Error(err)
        }
    }
}

impl ProjectCommandRunner for DefaultProjectCommandRunner {
    fn plan(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        let _span = ctx.span().entered();
        let outcome = outcome_of(self.do_plan(ctx), Outcome::Plan);
        ProjectResult::new(CommandName::Plan, ctx, outcome)
    }

    fn policy_check(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        let _span = ctx.span().entered();
        let outcome = outcome_of(self.do_policy_check(ctx), Outcome::PolicyCheck);
        ProjectResult::new(CommandName::PolicyCheck, ctx, outcome)
    }

    fn apply(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        let _span = ctx.span().entered();
        let outcome = outcome_of(self.do_apply(ctx), |applied| match applied {
            ApplyOutcome::Applied(output) => Outcome::Apply(output),
            ApplyOutcome::Rejected(reason) => Outcome::Failure(reason),
        });
        ProjectResult::new(CommandName::Apply, ctx, outcome)
    }

    fn approve_policies(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        // Prior policy-check state is not verified.
        let outcome = Outcome::PolicyCheck(PolicyCheckSuccess {
            output: POLICIES_APPROVED.to_string(),
            ..PolicyCheckSuccess::default()
        });
        ProjectResult::new(CommandName::PolicyCheck, ctx, outcome)
    }

    fn version(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        let _span = ctx.span().entered();
        let outcome = outcome_of(self.do_version(ctx), Outcome::Version);
        ProjectResult::new(CommandName::Version, ctx, outcome)
    }
}

impl<R: ProjectCommandRunner + ?Sized> ProjectCommandRunner for Arc<R> {
    fn plan(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        (**self).plan(ctx)
    }

    fn policy_check(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        (**self).policy_check(ctx)
    }

    fn apply(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        (**self).apply(ctx)
    }

    fn approve_policies(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        (**self).approve_policies(ctx)
    }

    fn version(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        (**self).version(ctx)
    }
}
