//! Apply gate: business rules consulted before any apply step runs.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::core::types::{ApplyRequirementKind, ProjectCommandContext};
use crate::io::working_dir::WorkingDir;

pub const NOT_APPROVED_REASON: &str =
    "Pull request must be approved by at least one person other than the author before running apply.";
pub const NOT_MERGEABLE_REASON: &str = "Pull request must be mergeable before running apply.";
pub const DIVERGED_REASON: &str =
    "Default branch must be rebased onto pull request before running apply.";

/// Decides whether apply may proceed.
pub trait ApplyRequirement: Send + Sync {
    /// `Ok(Some(reason))` rejects the apply; `Ok(None)` lets it through.
    fn validate_project(&self, repo_dir: &Path, ctx: &ProjectCommandContext)
    -> Result<Option<String>>;
}

/// Checks the context's configured requirements in order and returns the first rejection.
#[derive(Clone)]
pub struct AggregateApplyRequirements {
    working_dir: Arc<dyn WorkingDir>,
}

impl AggregateApplyRequirements {
    pub fn new(working_dir: Arc<dyn WorkingDir>) -> Self {
        Self { working_dir }
    }
}

impl ApplyRequirement for AggregateApplyRequirements {
    fn validate_project(
        &self,
        repo_dir: &Path,
        ctx: &ProjectCommandContext,
    ) -> Result<Option<String>> {
        for requirement in &ctx.apply_requirements {
            let rejected = match requirement {
                ApplyRequirementKind::Approved => {
                    (!ctx.pull_status.approved).then_some(NOT_APPROVED_REASON)
                }
                ApplyRequirementKind::Mergeable => {
                    (!ctx.pull_status.mergeable).then_some(NOT_MERGEABLE_REASON)
                }
                ApplyRequirementKind::Undiverged => self
                    .working_dir
                    .has_diverged(repo_dir)
                    .then_some(DIVERGED_REASON),
            };
            if let Some(reason) = rejected {
                debug!(?requirement, "apply requirement not met");
                return Ok(Some(reason.to_string()));
            }
        }
        Ok(None)
    }
}
