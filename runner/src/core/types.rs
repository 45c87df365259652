//! Invocation context and step types shared by every project command.
//!
//! These types describe one command invocation. They are built by the caller
//! (webhook handler, CLI) and never mutated while the command runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{Span, info_span};

/// Environment accumulator threaded through one pipeline run.
///
/// Only `env` steps write to it; every later step in the same run reads it.
pub type Envs = BTreeMap<String, String>;

/// A VCS repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repo {
    /// `owner/name`, e.g. `acme/infra`.
    pub full_name: String,
    pub owner: String,
    pub name: String,
    /// URL used to clone the repository.
    pub clone_url: String,
}

impl Repo {
    /// Build a repo from `owner/name`, splitting owner and name on the last `/`.
    pub fn new(full_name: &str, clone_url: &str) -> Self {
        let (owner, name) = full_name.rsplit_once('/').unwrap_or(("", full_name));
        Self {
            full_name: full_name.to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            clone_url: clone_url.to_string(),
        }
    }
}

/// The pull request a command runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequest {
    pub num: u64,
    /// Commit sha at the head of the pull request branch.
    pub head_commit: String,
    pub head_branch: String,
    pub base_branch: String,
    /// Username of the pull request author.
    pub author: String,
    /// Repository the pull request will be merged into.
    pub base_repo: Repo,
}

/// The VCS user that triggered the command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
}

/// Review state of the pull request, as reported by the VCS host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullStatus {
    pub approved: bool,
    pub mergeable: bool,
}

/// A requirement that must hold before `apply` may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyRequirementKind {
    /// Someone other than the author approved the pull request.
    Approved,
    /// The VCS host reports the pull request as mergeable.
    Mergeable,
    /// The base branch has not moved since the working copy was synced.
    Undiverged,
}

/// One configured unit of pipeline execution.
///
/// Built-in kinds carry extra arguments for the underlying tool. `run` carries
/// a raw shell command and `env` sets a variable for the remaining steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Step {
    Init {
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Plan {
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Show {
        #[serde(default)]
        extra_args: Vec<String>,
    },
    PolicyCheck {
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Apply {
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Version {
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Run {
        command: String,
    },
    Env {
        /// Variable name to set.
        #[serde(rename = "env_var_name")]
        name: String,
        /// Command whose trimmed output becomes the value when `value` is empty.
        #[serde(default)]
        command: String,
        /// Static value; takes precedence over `command`.
        #[serde(default, rename = "env_var_value")]
        value: String,
    },
    /// A step name this build does not know. Executes as a no-op.
    #[serde(other)]
    Unknown,
}

impl Step {
    /// Name used in configuration and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Init { .. } => "init",
            Step::Plan { .. } => "plan",
            Step::Show { .. } => "show",
            Step::PolicyCheck { .. } => "policy_check",
            Step::Apply { .. } => "apply",
            Step::Version { .. } => "version",
            Step::Run { .. } => "run",
            Step::Env { .. } => "env",
            Step::Unknown => "unknown",
        }
    }
}

/// Everything needed to run one command for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectCommandContext {
    /// Project directory relative to the repository root.
    pub repo_rel_dir: String,
    pub workspace: String,
    /// Display name of the project; may be empty.
    pub project_name: String,
    pub pull: PullRequest,
    /// Repository the pull request branch lives in (differs from the base repo for forks).
    pub head_repo: Repo,
    /// Ordered, pre-validated pipeline for this command.
    pub steps: Vec<Step>,
    pub user: User,
    /// Comment that re-runs plan for this project.
    pub replan_cmd: String,
    /// Comment that applies this project.
    pub apply_cmd: String,
    /// Requirements checked in order before `apply`.
    pub apply_requirements: Vec<ApplyRequirementKind>,
    pub pull_status: PullStatus,
}

impl ProjectCommandContext {
    /// Log span scoped to this command. Every flow records its events under it.
    pub fn span(&self) -> Span {
        info_span!(
            "project",
            repo = %self.pull.base_repo.full_name,
            pull = self.pull.num,
            workspace = %self.workspace,
            dir = %self.repo_rel_dir,
        )
    }

    /// Plan file name for this workspace/project, unique within the project directory.
    pub fn plan_filename(&self) -> String {
        if self.project_name.is_empty() {
            return format!("{}.tfplan", self.workspace);
        }
        let project = self.project_name.replace('/', "::");
        format!("{}-{}.tfplan", project, self.workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_new_splits_owner_and_name() {
        let repo = Repo::new("acme/infra", "https://example.com/acme/infra.git");
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "infra");
    }

    #[test]
    fn steps_deserialize_with_name_tag() {
        let raw = r#"[
            {"name": "init"},
            {"name": "plan", "extra_args": ["-lock=false"]},
            {"name": "env", "env_var_name": "FOO", "env_var_value": "bar"},
            {"name": "run", "command": "echo hi"}
        ]"#;
        let steps: Vec<Step> = serde_json::from_str(raw).expect("parse steps");
        assert_eq!(
            steps,
            vec![
                Step::Init {
                    extra_args: Vec::new()
                },
                Step::Plan {
                    extra_args: vec!["-lock=false".to_string()]
                },
                Step::Env {
                    name: "FOO".to_string(),
                    command: String::new(),
                    value: "bar".to_string()
                },
                Step::Run {
                    command: "echo hi".to_string()
                },
            ]
        );
    }

    #[test]
    fn unrecognized_step_name_parses_as_unknown() {
        let step: Step = serde_json::from_str(r#"{"name": "lint"}"#).expect("parse step");
        assert_eq!(step, Step::Unknown);
    }

    #[test]
    fn plan_filename_includes_project_name_when_set() {
        let mut ctx = ProjectCommandContext {
            workspace: "staging".to_string(),
            ..ProjectCommandContext::default()
        };
        assert_eq!(ctx.plan_filename(), "staging.tfplan");
        ctx.project_name = "net/vpc".to_string();
        assert_eq!(ctx.plan_filename(), "net::vpc-staging.tfplan");
    }
}
