//! Post-apply notifications.
//!
//! Delivery is best-effort: the apply flow logs a send error and carries on.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::types::{PullRequest, Repo, User};

/// What happened when a project was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub workspace: String,
    pub user: User,
    pub repo: Repo,
    pub pull: PullRequest,
    /// True if every apply step succeeded.
    pub success: bool,
    /// Project directory relative to the repository root.
    pub directory: String,
}

/// Delivers apply notifications.
pub trait WebhooksSender: Send + Sync {
    fn send(&self, result: &ApplyResult) -> Result<()>;
}

/// Sends to every inner sender, attempting all of them even if some fail.
#[derive(Clone, Default)]
pub struct MultiWebhookSender {
    senders: Vec<Arc<dyn WebhooksSender>>,
}

impl MultiWebhookSender {
    pub fn new(senders: Vec<Arc<dyn WebhooksSender>>) -> Self {
        Self { senders }
    }
}

impl WebhooksSender for MultiWebhookSender {
    fn send(&self, result: &ApplyResult) -> Result<()> {
        let errors: Vec<String> = self
            .senders
            .iter()
            .filter_map(|sender| sender.send(result).err())
            .map(|err| format!("{err:#}"))
            .collect();
        if errors.is_empty() {
            return Ok(());
        }
        Err(anyhow!(
            "{} webhook(s) failed:\n- {}",
            errors.len(),
            errors.join("\n- ")
        ))
    }
}

/// Forwards only results whose workspace matches a regex.
#[derive(Clone)]
pub struct WorkspaceFilteredSender {
    workspace_regex: Regex,
    inner: Arc<dyn WebhooksSender>,
}

impl WorkspaceFilteredSender {
    pub fn new(workspace_regex: &str, inner: Arc<dyn WebhooksSender>) -> Result<Self> {
        let workspace_regex = Regex::new(workspace_regex)
            .with_context(|| format!("parse workspace regex {workspace_regex:?}"))?;
        Ok(Self {
            workspace_regex,
            inner,
        })
    }
}

impl WebhooksSender for WorkspaceFilteredSender {
    fn send(&self, result: &ApplyResult) -> Result<()> {
        if !self.workspace_regex.is_match(&result.workspace) {
            debug!(workspace = %result.workspace, "workspace filtered out of webhook");
            return Ok(());
        }
        self.inner.send(result)
    }
}

/// Emits apply results as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogWebhookSender;

impl WebhooksSender for LogWebhookSender {
    fn send(&self, result: &ApplyResult) -> Result<()> {
        let payload = serde_json::to_string(result).context("serialize apply result")?;
        info!(
            target: "project_runner::webhook",
            repo = %result.repo.full_name,
            pull = result.pull.num,
            workspace = %result.workspace,
            success = result.success,
            %payload,
            "apply finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<ApplyResult>>,
        fail: bool,
    }

    impl WebhooksSender for Recorder {
        fn send(&self, result: &ApplyResult) -> Result<()> {
            self.sent.lock().expect("lock").push(result.clone());
            if self.fail {
                return Err(anyhow!("endpoint down"));
            }
            Ok(())
        }
    }

    fn result(workspace: &str) -> ApplyResult {
        ApplyResult {
            workspace: workspace.to_string(),
            user: User::default(),
            repo: Repo::new("acme/infra", ""),
            pull: PullRequest::default(),
            success: true,
            directory: ".".to_string(),
        }
    }

    #[test]
    fn multi_sender_attempts_every_sender() {
        let failing = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let ok = Arc::new(Recorder::default());
        let multi =
            MultiWebhookSender::new(vec![failing.clone() as Arc<dyn WebhooksSender>, ok.clone()]);

        let err = multi.send(&result("default")).expect_err("one sender failed");
        assert!(err.to_string().contains("endpoint down"));
        assert_eq!(failing.sent.lock().expect("lock").len(), 1);
        assert_eq!(ok.sent.lock().expect("lock").len(), 1);
    }

    #[test]
    fn workspace_filter_skips_non_matching() {
        let inner = Arc::new(Recorder::default());
        let filtered = WorkspaceFilteredSender::new("^prod", inner.clone()).expect("regex");

        filtered.send(&result("staging")).expect("send");
        filtered.send(&result("production")).expect("send");

        let sent = inner.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].workspace, "production");
    }

    #[test]
    fn invalid_workspace_regex_is_rejected() {
        let inner = Arc::new(Recorder::default());
        assert!(WorkspaceFilteredSender::new("(", inner).is_err());
    }
}
