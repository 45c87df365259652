//! The single structured result every project command produces.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::core::error::ProjectError;
use crate::core::types::ProjectCommandContext;

/// Which command produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Plan,
    Apply,
    PolicyCheck,
    ApprovePolicies,
    Version,
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandName::Plan => "plan",
            CommandName::Apply => "apply",
            CommandName::PolicyCheck => "policy_check",
            CommandName::ApprovePolicies => "approve_policies",
            CommandName::Version => "version",
        };
        f.write_str(name)
    }
}

/// Successful plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSuccess {
    /// Joined step output.
    pub output: String,
    /// URL of the pull-request lock, set by the locking decorator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_url: Option<String>,
    pub replan_cmd: String,
    pub apply_cmd: String,
    /// Whether the base branch moved since the working copy was last synced.
    pub has_diverged: bool,
}

static CHANGED_OUTSIDE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Note: Objects have changed outside of Terraform").expect("valid regex")
});
static PLAN_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Plan: \d+ to add, \d+ to change, \d+ to destroy\.|No changes\. Infrastructure is up-to-date\.|No changes\. Your infrastructure matches the configuration\.",
    )
    .expect("valid regex")
});
static DIFF_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^( +)([-+~]\s)(.*)(\s=\s\S*|\s\{|$)").expect("valid regex")
});
static DIFF_TILDE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^~").expect("valid regex"));

impl PlanSuccess {
    /// One-line plan summary, prefixed with a bold note when resources drifted.
    ///
    /// Empty if the output contains no recognizable summary line.
    pub fn summary(&self) -> String {
        let note = CHANGED_OUTSIDE_RE
            .find(&self.output)
            .map(|m| format!("\n**{}**\n", m.as_str()))
            .unwrap_or_default();
        let summary = PLAN_SUMMARY_RE
            .find(&self.output)
            .map(|m| m.as_str())
            .unwrap_or_default();
        format!("{note}{summary}")
    }

    /// Output rewritten so markdown `diff` blocks highlight changes.
    ///
    /// Moves `+ `/`- `/`~ ` markers to column 0 and turns a leading `~` into `!`.
    pub fn diff_markdown_formatted_output(&self) -> String {
        let formatted = DIFF_KEYWORD_RE.replace_all(&self.output, "${2}${1}${3}${4}");
        DIFF_TILDE_RE.replace_all(&formatted, "!").into_owned()
    }
}

/// Successful policy check (or policy approval).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyCheckSuccess {
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_url: Option<String>,
    pub replan_cmd: String,
    pub apply_cmd: String,
    pub has_diverged: bool,
}

/// Exactly one of success payload, failure reason or error.
#[derive(Debug)]
pub enum Outcome {
    Plan(PlanSuccess),
    PolicyCheck(PolicyCheckSuccess),
    Apply(String),
    Version(String),
    /// Expected business outcome, e.g. an apply requirement rejected the command.
    Failure(String),
    /// System fault.
    Error(ProjectError),
}

/// Commit status a result maps to on the VCS host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Success,
    Failed,
}

/// Plan lifecycle state implied by a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    ErroredPlan,
    PassedPolicyCheck,
    ErroredPolicyCheck,
    Applied,
    ErroredApply,
    /// The command does not move the plan lifecycle (e.g. `version`).
    Unchanged,
}

/// Result of one project command, correlated back to its project.
#[derive(Debug)]
pub struct ProjectResult {
    pub command: CommandName,
    pub outcome: Outcome,
    pub repo_rel_dir: String,
    pub workspace: String,
    pub project_name: String,
}

impl ProjectResult {
    pub fn new(command: CommandName, ctx: &ProjectCommandContext, outcome: Outcome) -> Self {
        Self {
            command,
            outcome,
            repo_rel_dir: ctx.repo_rel_dir.clone(),
            workspace: ctx.workspace.clone(),
            project_name: ctx.project_name.clone(),
        }
    }

    pub fn plan_success(&self) -> Option<&PlanSuccess> {
        match &self.outcome {
            Outcome::Plan(success) => Some(success),
            _ => None,
        }
    }

    pub fn policy_check_success(&self) -> Option<&PolicyCheckSuccess> {
        match &self.outcome {
            Outcome::PolicyCheck(success) => Some(success),
            _ => None,
        }
    }

    pub fn apply_success(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Apply(output) => Some(output),
            _ => None,
        }
    }

    pub fn version_success(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Version(output) => Some(output),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failure(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ProjectError> {
        match &self.outcome {
            Outcome::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_successful(&self) -> bool {
        !matches!(self.outcome, Outcome::Failure(_) | Outcome::Error(_))
    }

    pub fn commit_status(&self) -> CommitStatus {
        if self.is_successful() {
            CommitStatus::Success
        } else {
            CommitStatus::Failed
        }
    }

    pub fn plan_status(&self) -> PlanStatus {
        let ok = self.is_successful();
        match self.command {
            CommandName::Plan if ok => PlanStatus::Planned,
            CommandName::Plan => PlanStatus::ErroredPlan,
            CommandName::PolicyCheck | CommandName::ApprovePolicies if ok => {
                PlanStatus::PassedPolicyCheck
            }
            CommandName::PolicyCheck | CommandName::ApprovePolicies => {
                PlanStatus::ErroredPolicyCheck
            }
            CommandName::Apply if ok => PlanStatus::Applied,
            CommandName::Apply => PlanStatus::ErroredApply,
            CommandName::Version => PlanStatus::Unchanged,
        }
    }
}

#[derive(Serialize)]
struct WireResult<'a> {
    command: CommandName,
    repo_rel_dir: &'a str,
    workspace: &'a str,
    project_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_success: Option<&'a PlanSuccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy_check_success: Option<&'a PolicyCheckSuccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    apply_success: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version_success: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Serialize for ProjectResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireResult {
            command: self.command,
            repo_rel_dir: &self.repo_rel_dir,
            workspace: &self.workspace,
            project_name: &self.project_name,
            plan_success: self.plan_success(),
            policy_check_success: self.policy_check_success(),
            apply_success: self.apply_success(),
            version_success: self.version_success(),
            failure: self.failure(),
            error: self.error().map(ToString::to_string),
        }
        .serialize(serializer)
    }
}
