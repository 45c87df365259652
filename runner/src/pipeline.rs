//! Sequential step dispatch for one project command.
//!
//! Steps run strictly in configured order because later steps depend on the
//! filesystem and environment effects of earlier ones. The first failing step
//! ends the pipeline.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::types::{Envs, ProjectCommandContext, Step};
use crate::io::step_runners::StepRunners;

/// A step failed; `outputs` holds everything produced before it.
#[derive(Debug, Error)]
#[error("{source:#}")]
pub struct PipelineError {
    pub outputs: Vec<String>,
    pub source: anyhow::Error,
}

impl PipelineError {
    /// Outputs produced before the failure, newline-joined.
    pub fn joined_outputs(&self) -> String {
        self.outputs.join("\n")
    }
}

/// Run `steps` in `abs_path` and collect their visible, non-empty outputs.
///
/// `env` steps write the accumulator instead of producing output, and `show`
/// output is discarded. The accumulator starts empty on every call.
#[instrument(skip_all, fields(path = %abs_path.display(), steps = steps.len()))]
pub fn run_steps(
    runners: &StepRunners,
    steps: &[Step],
    ctx: &ProjectCommandContext,
    abs_path: &Path,
) -> Result<Vec<String>, PipelineError> {
    let mut outputs = Vec::new();
    let mut envs = Envs::new();

    for (index, step) in steps.iter().enumerate() {
        debug!(index, step = step.name(), "running step");
        match run_step(runners, step, ctx, abs_path, &mut envs) {
            Ok(Some(out)) if !out.is_empty() => outputs.push(out),
            Ok(_) => {}
            Err(source) => {
                debug!(index, step = step.name(), "step failed, stopping pipeline");
                return Err(PipelineError { outputs, source });
            }
        }
    }
    Ok(outputs)
}

/// Run one step. `None` means the step has no user-visible output.
fn run_step(
    runners: &StepRunners,
    step: &Step,
    ctx: &ProjectCommandContext,
    abs_path: &Path,
    envs: &mut Envs,
) -> anyhow::Result<Option<String>> {
    let out = match step {
        Step::Init { extra_args } => runners.init.run(ctx, extra_args, abs_path, envs)?,
        Step::Plan { extra_args } => runners.plan.run(ctx, extra_args, abs_path, envs)?,
        Step::Show { extra_args } => {
            runners.show.run(ctx, extra_args, abs_path, envs)?;
            return Ok(None);
        }
        Step::PolicyCheck { extra_args } => {
            runners.policy_check.run(ctx, extra_args, abs_path, envs)?
        }
        Step::Apply { extra_args } => runners.apply.run(ctx, extra_args, abs_path, envs)?,
        Step::Version { extra_args } => runners.version.run(ctx, extra_args, abs_path, envs)?,
        Step::Run { command } => runners.run.run(ctx, command, abs_path, envs)?,
        Step::Env {
            name,
            command,
            value,
        } => {
            let resolved = runners.env.run(ctx, command, value, abs_path, envs)?;
            envs.insert(name.clone(), resolved);
            return Ok(None);
        }
        Step::Unknown => {
            debug!("skipping unknown step");
            return Ok(None);
        }
    };
    Ok(Some(out))
}
