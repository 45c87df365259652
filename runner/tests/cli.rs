//! End-to-end runs of the `project-runner` binary.
//!
//! The tool binary is configured as `echo`, so every built-in step prints the
//! arguments it would have passed to the real tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{Value, json};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_project-runner");

struct Env {
    temp: TempDir,
    config: PathBuf,
    origin: PathBuf,
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

impl Env {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        fs::create_dir_all(origin.join("infra")).expect("mkdir");
        git(&origin, &["init", "-q"]);
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        fs::write(origin.join("infra/main.tf"), "# base\n").expect("write");
        git(&origin, &["add", "."]);
        git(&origin, &["commit", "-q", "-m", "init"]);

        let config = temp.path().join("runner.toml");
        fs::write(
            &config,
            format!(
                "data_dir = {:?}\n\n[tool]\nbinary = \"echo\"\n",
                temp.path().join("data").display().to_string()
            ),
        )
        .expect("write config");
        Self {
            temp,
            config,
            origin,
        }
    }

    fn context(&self, steps: Value, extra: Value) -> PathBuf {
        let url = format!("file://{}", self.origin.display());
        let repo = json!({"full_name": "acme/infra", "owner": "acme", "name": "infra", "clone_url": url});
        let mut ctx = json!({
            "repo_rel_dir": "infra",
            "workspace": "default",
            "pull": {
                "num": 3,
                "head_commit": git(&self.origin, &["rev-parse", "HEAD"]),
                "head_branch": "main",
                "base_branch": "main",
                "author": "bob",
                "base_repo": repo,
            },
            "head_repo": repo,
            "user": {"username": "alice"},
            "steps": steps,
        });
        if let (Some(ctx), Some(extra)) = (ctx.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                ctx.insert(key.clone(), value.clone());
            }
        }
        let path = self.temp.path().join("ctx.json");
        fs::write(&path, ctx.to_string()).expect("write context");
        path
    }

    fn run(&self, command: &str, context: &Path) -> (Output, Value) {
        let output = Command::new(BIN)
            .arg(command)
            .arg("--context")
            .arg(context)
            .arg("--config")
            .arg(&self.config)
            .output()
            .expect("run binary");
        let value = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
        (output, value)
    }
}

#[test]
fn plan_then_gated_apply() {
    let env = Env::new();
    let ctx = env.context(
        json!([
            {"name": "init"},
            {"name": "env", "env_var_name": "STAGE", "env_var_value": "dev"},
            {"name": "run", "command": "echo stage=$STAGE ws=$WORKSPACE"},
        ]),
        json!({}),
    );

    let (output, value) = env.run("plan", &ctx);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(value["command"], "plan");
    let plan_output = value["plan_success"]["output"].as_str().expect("output");
    assert_eq!(
        plan_output,
        "init -input=false -no-color\n\nstage=dev ws=default\n"
    );
    assert!(
        value["plan_success"]["lock_url"]
            .as_str()
            .expect("lock url")
            .ends_with("/lock?id=acme%2Finfra%2Finfra%2Fdefault")
    );

    let gated = env.context(
        json!([{"name": "apply"}]),
        json!({
            "apply_requirements": ["mergeable"],
            "pull_status": {"approved": true, "mergeable": false},
        }),
    );
    let (output, value) = env.run("apply", &gated);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(
        value["failure"],
        "Pull request must be mergeable before running apply."
    );
}

#[test]
fn version_without_plan_is_an_error() {
    let env = Env::new();
    let ctx = env.context(json!([{"name": "version"}]), json!({}));

    let (output, value) = env.run("version", &ctx);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(value["error"], "project has not been cloned–did you run plan?");
}

#[test]
fn approve_policies_prints_success() {
    let env = Env::new();
    let ctx = env.context(json!([]), json!({}));

    let (output, value) = env.run("approve-policies", &ctx);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(value["command"], "policy_check");
    assert_eq!(value["policy_check_success"]["output"], "Policies approved");
}

#[test]
fn unreadable_context_exits_with_error() {
    let env = Env::new();
    let missing = env.temp.path().join("missing.json");

    let (output, value) = env.run("plan", &missing);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(value, Value::Null);
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing.json"));
}
