//! Command context files consumed by the CLI.

use std::fs;
use std::path::{Component, Path};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::types::ProjectCommandContext;
use crate::io::working_dir::is_single_name;

/// Workspace used when a context leaves it empty.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Read a [`ProjectCommandContext`] from a JSON file.
///
/// An empty workspace becomes [`DEFAULT_WORKSPACE`] and an empty `repo_rel_dir`
/// becomes `.`. The pull request must name its base repository. The repository
/// name, workspace and project dir all become parts of on-disk paths, so none
/// of them may step outside the directory they are joined onto.
pub fn load_context(path: &Path) -> Result<ProjectCommandContext> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut ctx: ProjectCommandContext =
        serde_json::from_str(&raw).with_context(|| format!("parse context {}", path.display()))?;

    if ctx.workspace.is_empty() {
        ctx.workspace = DEFAULT_WORKSPACE.to_string();
    }
    if ctx.repo_rel_dir.is_empty() {
        ctx.repo_rel_dir = ".".to_string();
    }
    if ctx.pull.base_repo.full_name.is_empty() {
        return Err(anyhow!(
            "context {} is missing pull.base_repo.full_name",
            path.display()
        ));
    }
    if Path::new(&ctx.repo_rel_dir).is_absolute() {
        return Err(anyhow!(
            "repo_rel_dir must be relative, got {:?}",
            ctx.repo_rel_dir
        ));
    }
    ensure_contained("repo_rel_dir", &ctx.repo_rel_dir)?;
    ensure_contained("pull.base_repo.full_name", &ctx.pull.base_repo.full_name)?;
    if Path::new(&ctx.pull.base_repo.full_name).is_absolute() {
        return Err(anyhow!(
            "pull.base_repo.full_name must be relative, got {:?}",
            ctx.pull.base_repo.full_name
        ));
    }
    if !is_single_name(&ctx.workspace) {
        return Err(anyhow!(
            "workspace must be a single path segment, got {:?}",
            ctx.workspace
        ));
    }

    debug!(
        repo = %ctx.pull.base_repo.full_name,
        pull = ctx.pull.num,
        steps = ctx.steps.len(),
        "loaded context"
    );
    Ok(ctx)
}

/// Reject values with `..` parts.
fn ensure_contained(field: &str, value: &str) -> Result<()> {
    if Path::new(value)
        .components()
        .any(|part| part == Component::ParentDir)
    {
        return Err(anyhow!("{field} must not contain '..', got {value:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Step;

    fn write(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("ctx.json");
        fs::write(&path, body).expect("write");
        path
    }

    #[test]
    fn fills_workspace_and_dir_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"pull": {"num": 4, "base_repo": {"full_name": "acme/infra"}},
                "steps": [{"name": "init"}]}"#,
        );

        let ctx = load_context(&path).expect("load");
        assert_eq!(ctx.workspace, "default");
        assert_eq!(ctx.repo_rel_dir, ".");
        assert_eq!(ctx.pull.num, 4);
        assert_eq!(
            ctx.steps,
            vec![Step::Init {
                extra_args: Vec::new()
            }]
        );
    }

    #[test]
    fn rejects_missing_base_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(temp.path(), r#"{"workspace": "default"}"#);
        let err = load_context(&path).expect_err("missing repo");
        assert!(err.to_string().contains("pull.base_repo.full_name"));
    }

    #[test]
    fn rejects_absolute_project_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"repo_rel_dir": "/etc", "pull": {"base_repo": {"full_name": "acme/infra"}}}"#,
        );
        assert!(load_context(&path).is_err());
    }

    #[test]
    fn reports_malformed_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(temp.path(), "{not json");
        let err = load_context(&path).expect_err("bad json");
        assert!(format!("{err:#}").contains("parse context"));
    }

    fn context_with(workspace: &str, dir: &str, repo: &str) -> String {
        serde_json::json!({
            "workspace": workspace,
            "repo_rel_dir": dir,
            "pull": {"num": 7, "base_repo": {"full_name": repo}},
        })
        .to_string()
    }

    #[test]
    fn rejects_workspace_outside_pull_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        for workspace in ["..", ".", "a/b", "../other", "team/.."] {
            let path = write(temp.path(), &context_with(workspace, ".", "acme/infra"));
            let err = load_context(&path).expect_err(workspace);
            assert!(err.to_string().contains("workspace"), "{workspace}: {err}");
        }
    }

    #[test]
    fn rejects_parent_parts_in_project_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        for dir in ["..", "../../../../etc", "modules/../../escape"] {
            let path = write(temp.path(), &context_with("default", dir, "acme/infra"));
            let err = load_context(&path).expect_err(dir);
            assert!(err.to_string().contains("repo_rel_dir"), "{dir}: {err}");
        }
    }

    #[test]
    fn rejects_parent_parts_in_repo_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        for repo in ["../infra", "acme/../..", "/etc"] {
            let path = write(temp.path(), &context_with("default", ".", repo));
            let err = load_context(&path).expect_err(repo);
            assert!(err.to_string().contains("full_name"), "{repo}: {err}");
        }
    }

    #[test]
    fn accepts_nested_project_dir_and_named_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            &context_with("staging", "modules/./network", "acme/infra"),
        );
        let ctx = load_context(&path).expect("load");
        assert_eq!(ctx.workspace, "staging");
        assert_eq!(ctx.repo_rel_dir, "modules/./network");
    }
}
