//! Classified errors surfaced in a [`ProjectResult`](crate::core::result::ProjectResult).

use std::path::PathBuf;

use thiserror::Error;

/// Failure to take the per-directory lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another command already holds the lock for this key. Retriable by the caller.
    #[error(
        "the {workspace} workspace is currently locked by another command that is running for this pull request–wait until the previous command is complete and try again"
    )]
    Unavailable { key: String, workspace: String },
    #[error(transparent)]
    Backend(anyhow::Error),
}

/// Failure to locate an existing working directory.
#[derive(Debug, Error)]
pub enum WorkingDirError {
    #[error("working directory {} does not exist", .0.display())]
    NotExist(PathBuf),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// System fault that ended a project command.
///
/// Business-rule rejections are not errors; they travel as a failure string.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Lock(#[from] LockError),
    /// The working directory was never created by a plan.
    #[error("project has not been cloned–did you run plan?")]
    NotCloned,
    /// The checkout exists but the project subdirectory does not.
    #[error("dir {repo_rel_dir:?} does not exist")]
    ProjectDirMissing { repo_rel_dir: String },
    #[error(transparent)]
    WorkingDir(anyhow::Error),
    #[error(transparent)]
    ApplyRequirements(anyhow::Error),
    /// A step failed. `output` holds every line produced before it, joined by newlines.
    #[error("{source:#}\n{output}")]
    StepFailed {
        source: anyhow::Error,
        output: String,
    },
}

impl ProjectError {
    pub fn is_not_cloned(&self) -> bool {
        matches!(self, ProjectError::NotCloned)
    }

    pub fn is_project_dir_missing(&self) -> bool {
        matches!(self, ProjectError::ProjectDirMissing { .. })
    }

    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, ProjectError::Lock(LockError::Unavailable { .. }))
    }

    pub fn is_step_failure(&self) -> bool {
        matches!(self, ProjectError::StepFailed { .. })
    }
}

impl From<WorkingDirError> for ProjectError {
    fn from(err: WorkingDirError) -> Self {
        match err {
            WorkingDirError::NotExist(_) => ProjectError::NotCloned,
            WorkingDirError::Other(err) => ProjectError::WorkingDir(err),
        }
    }
}
