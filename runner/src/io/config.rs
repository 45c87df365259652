//! Runner configuration stored as TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::working_dir::CheckoutStrategy;

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values suitable for a single-host deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root under which pull request checkouts are kept.
    pub data_dir: PathBuf,

    pub checkout_strategy: CheckoutStrategy,

    /// Base URL of the server that renders lock pages.
    pub lock_url_base: String,

    pub tool: ToolConfig,

    pub run_step: RunStepConfig,

    pub webhooks: WebhooksConfig,
}

/// Binary and base arguments for the built-in steps.
///
/// `{planfile}` in any argument is replaced with the workspace's plan file path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    pub binary: String,
    /// Per-step wall-clock limit in seconds.
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    pub init_args: Vec<String>,
    pub plan_args: Vec<String>,
    pub show_args: Vec<String>,
    pub policy_check_args: Vec<String>,
    pub apply_args: Vec<String>,
    pub version_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunStepConfig {
    /// Shell used for `run` and `env` steps, invoked as `<shell> -c <command>`.
    pub shell: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhooksConfig {
    /// Only applies in workspaces matching this regex are reported.
    pub workspace_regex: String,
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            init_args: args(&["init", "-input=false", "-no-color"]),
            plan_args: args(&[
                "plan",
                "-input=false",
                "-refresh",
                "-no-color",
                "-out",
                "{planfile}",
            ]),
            show_args: args(&["show", "-no-color", "-json", "{planfile}"]),
            policy_check_args: args(&["show", "-no-color", "{planfile}"]),
            apply_args: args(&["apply", "-input=false", "-no-color", "{planfile}"]),
            version_args: args(&["version"]),
        }
    }
}

impl Default for RunStepConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            workspace_regex: ".*".to_string(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".project-runner"),
            checkout_strategy: CheckoutStrategy::Branch,
            lock_url_base: "http://localhost:4141".to_string(),
            tool: ToolConfig::default(),
            run_step: RunStepConfig::default(),
            webhooks: WebhooksConfig::default(),
        }
    }
}

impl ToolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RunStepConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data_dir must be set"));
        }
        if self.tool.binary.trim().is_empty() {
            return Err(anyhow!("tool.binary must be set"));
        }
        if self.tool.timeout_secs == 0 || self.run_step.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.tool.output_limit_bytes == 0 || self.run_step.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.run_step.shell.trim().is_empty() {
            return Err(anyhow!("run_step.shell must be set"));
        }
        regex::Regex::new(&self.webhooks.workspace_regex).with_context(|| {
            format!(
                "invalid webhooks.workspace_regex {:?}",
                self.webhooks.workspace_regex
            )
        })?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "checkout_strategy = \"merge\"\n[tool]\nbinary = \"tofu\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.checkout_strategy, CheckoutStrategy::Merge);
        assert_eq!(cfg.tool.binary, "tofu");
        assert_eq!(cfg.tool.version_args, vec!["version".to_string()]);
    }

    #[test]
    fn rejects_invalid_workspace_regex() {
        let cfg = RunnerConfig {
            webhooks: WebhooksConfig {
                workspace_regex: "(".to_string(),
            },
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
