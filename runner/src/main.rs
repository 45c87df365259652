//! Per-project command runner CLI.
//!
//! Runs one command for one project against a JSON context file and prints
//! the result as JSON on stdout. Exit codes are listed in `exit_codes`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use project_runner::core::result::ProjectResult;
use project_runner::exit_codes;
use project_runner::io::apply_requirements::AggregateApplyRequirements;
use project_runner::io::config::{RunnerConfig, load_config};
use project_runner::io::context::load_context;
use project_runner::io::locker::DefaultWorkingDirLocker;
use project_runner::io::step_runners::{
    DefaultEnvStepRunner, RunStepRunner, StepRunner, StepRunners, ToolStepRunner,
};
use project_runner::io::webhooks::{LogWebhookSender, WorkspaceFilteredSender};
use project_runner::io::working_dir::{FileWorkspace, WorkingDir};
use project_runner::locking::{BasicLockUrlGenerator, MemoryProjectLocker, ProjectCommandLocker};
use project_runner::logging;
use project_runner::project::{DefaultProjectCommandRunner, ProjectCommandRunner};

#[derive(Parser)]
#[command(
    name = "project-runner",
    version,
    about = "Run plan/apply style commands for one project of a pull request"
)]
struct Cli {
    /// Runner configuration file. Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "project-runner.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Clone or reuse the checkout and run the plan steps.
    Plan(ContextArgs),
    /// Run the apply steps against the planned checkout.
    Apply(ContextArgs),
    /// Run the policy check steps against the planned checkout.
    PolicyCheck(ContextArgs),
    /// Mark policies as approved.
    ApprovePolicies(ContextArgs),
    /// Run the version steps against the planned checkout.
    Version(ContextArgs),
}

#[derive(clap::Args)]
struct ContextArgs {
    /// JSON file holding the project command context.
    #[arg(long)]
    context: PathBuf,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let runner = build_runner(&cfg)?;

    let result = match &cli.command {
        Command::Plan(args) => runner.plan(&load_context(&args.context)?),
        Command::Apply(args) => runner.apply(&load_context(&args.context)?),
        Command::PolicyCheck(args) => runner.policy_check(&load_context(&args.context)?),
        Command::ApprovePolicies(args) => runner.approve_policies(&load_context(&args.context)?),
        Command::Version(args) => runner.version(&load_context(&args.context)?),
    };
    print_result(&result)?;
    Ok(exit_codes::for_result(&result))
}

fn tool_runner(cfg: &RunnerConfig, args: &[String]) -> Arc<dyn StepRunner> {
    Arc::new(ToolStepRunner {
        binary: cfg.tool.binary.clone(),
        args: args.to_vec(),
        timeout: cfg.tool.timeout(),
        output_limit_bytes: cfg.tool.output_limit_bytes,
    })
}

fn build_runner(cfg: &RunnerConfig) -> Result<ProjectCommandLocker<DefaultProjectCommandRunner>> {
    debug!(data_dir = %cfg.data_dir.display(), "building runner");
    let run_step = RunStepRunner {
        shell: cfg.run_step.shell.clone(),
        timeout: cfg.run_step.timeout(),
        output_limit_bytes: cfg.run_step.output_limit_bytes,
    };
    let steps = StepRunners {
        init: tool_runner(cfg, &cfg.tool.init_args),
        plan: tool_runner(cfg, &cfg.tool.plan_args),
        show: tool_runner(cfg, &cfg.tool.show_args),
        policy_check: tool_runner(cfg, &cfg.tool.policy_check_args),
        apply: tool_runner(cfg, &cfg.tool.apply_args),
        version: tool_runner(cfg, &cfg.tool.version_args),
        run: Arc::new(run_step.clone()),
        env: Arc::new(DefaultEnvStepRunner { run_step }),
    };

    let working_dir: Arc<dyn WorkingDir> = Arc::new(FileWorkspace::new(
        absolute(&cfg.data_dir)?,
        cfg.checkout_strategy,
    ));
    let webhooks =
        WorkspaceFilteredSender::new(&cfg.webhooks.workspace_regex, Arc::new(LogWebhookSender))?;
    let lock_urls = BasicLockUrlGenerator::new(&cfg.lock_url_base)?;

    let runner = DefaultProjectCommandRunner::new(
        steps,
        Arc::clone(&working_dir),
        Arc::new(DefaultWorkingDirLocker::new()),
        Arc::new(webhooks),
        Arc::new(AggregateApplyRequirements::new(working_dir)),
    );
    Ok(runner.with_locking(Arc::new(MemoryProjectLocker::new()), Arc::new(lock_urls)))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("resolve current directory")?;
    Ok(cwd.join(path))
}

fn print_result(result: &ProjectResult) -> Result<()> {
    let payload = serde_json::to_string_pretty(result).context("serialize result")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_with_context() {
        let cli = Cli::parse_from(["project-runner", "plan", "--context", "ctx.json"]);
        assert_eq!(cli.config, PathBuf::from("project-runner.toml"));
        match cli.command {
            Command::Plan(args) => assert_eq!(args.context, PathBuf::from("ctx.json")),
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from([
            "project-runner",
            "policy-check",
            "--context",
            "ctx.json",
            "--config",
            "/etc/runner.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/runner.toml"));
        assert!(matches!(cli.command, Command::PolicyCheck(_)));
    }

    #[test]
    fn parse_approve_policies() {
        let cli = Cli::parse_from(["project-runner", "approve-policies", "--context", "c.json"]);
        assert!(matches!(cli.command, Command::ApprovePolicies(_)));
    }

    #[test]
    fn context_is_required() {
        assert!(Cli::try_parse_from(["project-runner", "apply"]).is_err());
    }

    #[test]
    fn default_config_builds_a_runner() {
        build_runner(&RunnerConfig::default()).expect("runner");
    }
}
