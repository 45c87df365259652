//! Test-only fakes for the runner's collaborators.
//!
//! Every fake records what it was asked to do so tests can assert on call
//! order, lock lifetimes and notifications without spawning processes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::error::{LockError, WorkingDirError};
use crate::core::types::{Envs, ProjectCommandContext, PullRequest, Repo, Step, User};
use crate::io::apply_requirements::ApplyRequirement;
use crate::io::locker::{DefaultWorkingDirLocker, WorkingDirLock, WorkingDirLocker};
use crate::io::step_runners::{CustomStepRunner, EnvStepRunner, StepRunner, StepRunners};
use crate::io::webhooks::{ApplyResult, WebhooksSender};
use crate::io::working_dir::{CloneOutcome, WorkingDir};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Context for `acme/infra` pull #7, workspace `default`, project dir `.`.
pub fn context(steps: Vec<Step>) -> ProjectCommandContext {
    let base_repo = Repo::new("acme/infra", "https://example.com/acme/infra.git");
    ProjectCommandContext {
        repo_rel_dir: ".".to_string(),
        workspace: "default".to_string(),
        project_name: String::new(),
        pull: PullRequest {
            num: 7,
            head_commit: "0123abcd".to_string(),
            head_branch: "feature".to_string(),
            base_branch: "main".to_string(),
            author: "bob".to_string(),
            base_repo: base_repo.clone(),
        },
        head_repo: base_repo,
        steps,
        user: User {
            username: "alice".to_string(),
        },
        replan_cmd: "runner plan -d .".to_string(),
        apply_cmd: "runner apply -d .".to_string(),
        ..ProjectCommandContext::default()
    }
}

/// Scripted behavior for one step kind.
#[derive(Clone)]
pub enum StepScript {
    Output(&'static str),
    Fail(&'static str),
    /// Arbitrary behavior, e.g. probing a lock while the step runs.
    Custom(Arc<dyn Fn(&Path, &Envs) -> Result<String> + Send + Sync>),
}

/// One recorded step invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCall {
    pub kind: String,
    pub path: PathBuf,
    pub envs: Envs,
}

#[derive(Default)]
struct RecorderState {
    scripts: HashMap<String, StepScript>,
    calls: Vec<StepCall>,
}

/// Step runners for every kind that share one call log.
///
/// Unscripted built-in kinds succeed with empty output, `run` echoes its
/// command, and `env` returns its static value or else its command.
#[derive(Clone, Default)]
pub struct RecordingRunners {
    state: Arc<Mutex<RecorderState>>,
}

impl RecordingRunners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the behavior of `kind` (`init`, `plan`, ..., `run`, `env`).
    pub fn script(&self, kind: &str, script: StepScript) {
        locked(&self.state).scripts.insert(kind.to_string(), script);
    }

    pub fn step_runners(&self) -> StepRunners {
        let builtin = |kind: &'static str| -> Arc<dyn StepRunner> {
            Arc::new(KindRecorder {
                kind,
                state: Arc::clone(&self.state),
            })
        };
        StepRunners {
            init: builtin("init"),
            plan: builtin("plan"),
            show: builtin("show"),
            policy_check: builtin("policy_check"),
            apply: builtin("apply"),
            version: builtin("version"),
            run: Arc::new(KindRecorder {
                kind: "run",
                state: Arc::clone(&self.state),
            }),
            env: Arc::new(KindRecorder {
                kind: "env",
                state: Arc::clone(&self.state),
            }),
        }
    }

    /// Kinds invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        locked(&self.state)
            .calls
            .iter()
            .map(|call| call.kind.clone())
            .collect()
    }

    /// Accumulator snapshot each invocation received.
    pub fn envs_seen(&self) -> Vec<Envs> {
        locked(&self.state)
            .calls
            .iter()
            .map(|call| call.envs.clone())
            .collect()
    }

    pub fn step_calls(&self) -> Vec<StepCall> {
        locked(&self.state).calls.clone()
    }
}

struct KindRecorder {
    kind: &'static str,
    state: Arc<Mutex<RecorderState>>,
}

impl KindRecorder {
    fn invoke(&self, path: &Path, envs: &Envs, default: impl FnOnce() -> String) -> Result<String> {
        // Release the state lock before running a custom script.
        let script = {
            let mut state = locked(&self.state);
            state.calls.push(StepCall {
                kind: self.kind.to_string(),
                path: path.to_path_buf(),
                envs: envs.clone(),
            });
            state.scripts.get(self.kind).cloned()
        };
        match script {
            None => Ok(default()),
            Some(StepScript::Output(out)) => Ok(out.to_string()),
            Some(StepScript::Fail(msg)) => Err(anyhow!(msg)),
            Some(StepScript::Custom(f)) => f(path, envs),
        }
    }
}

impl StepRunner for KindRecorder {
    fn run(
        &self,
        _ctx: &ProjectCommandContext,
        _extra_args: &[String],
        path: &Path,
        envs: &Envs,
    ) -> Result<String> {
        self.invoke(path, envs, String::new)
    }
}

impl CustomStepRunner for KindRecorder {
    fn run(
        &self,
        _ctx: &ProjectCommandContext,
        command: &str,
        path: &Path,
        envs: &Envs,
    ) -> Result<String> {
        self.invoke(path, envs, || command.to_string())
    }
}

impl EnvStepRunner for KindRecorder {
    fn run(
        &self,
        _ctx: &ProjectCommandContext,
        command: &str,
        value: &str,
        path: &Path,
        envs: &Envs,
    ) -> Result<String> {
        let resolved = if value.is_empty() { command } else { value };
        self.invoke(path, envs, || resolved.to_string())
    }
}

/// Working directories under a private temp dir, laid out like `FileWorkspace`.
pub struct FakeWorkingDir {
    root: TempDir,
    diverged: AtomicBool,
    clone_error: Mutex<Option<String>>,
    clones: AtomicUsize,
}

impl FakeWorkingDir {
    /// # Panics
    /// If the temp dir cannot be created.
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("create fake working dir root"),
            diverged: AtomicBool::new(false),
            clone_error: Mutex::new(None),
            clones: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    fn dir_for(&self, repo: &Repo, pull: &PullRequest, workspace: &str) -> PathBuf {
        self.root
            .path()
            .join("repos")
            .join(&repo.full_name)
            .join(pull.num.to_string())
            .join(workspace)
    }

    /// Checkout root `ctx` resolves to.
    pub fn checkout_dir(&self, ctx: &ProjectCommandContext) -> PathBuf {
        self.dir_for(&ctx.pull.base_repo, &ctx.pull, &ctx.workspace)
    }

    /// Create the checkout and project directory as a prior plan would have.
    ///
    /// # Panics
    /// If the directories cannot be created.
    pub fn create_checkout(&self, ctx: &ProjectCommandContext) -> PathBuf {
        let dir = self.checkout_dir(ctx);
        fs::create_dir_all(&dir).expect("create fake checkout");
        fs::create_dir_all(dir.join(&ctx.repo_rel_dir)).expect("create fake checkout");
        dir
    }

    pub fn set_diverged(&self, diverged: bool) {
        self.diverged.store(diverged, Ordering::SeqCst);
    }

    pub fn fail_clones(&self, msg: &str) {
        *locked(&self.clone_error) = Some(msg.to_string());
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }
}

impl Default for FakeWorkingDir {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkingDir for FakeWorkingDir {
    fn clone_or_reuse(
        &self,
        _head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<CloneOutcome> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = locked(&self.clone_error).clone() {
            return Err(anyhow!(msg));
        }
        let path = self.dir_for(&pull.base_repo, pull, workspace);
        fs::create_dir_all(&path)?;
        Ok(CloneOutcome {
            path,
            has_diverged: self.diverged.load(Ordering::SeqCst),
        })
    }

    fn get_working_dir(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf, WorkingDirError> {
        let dir = self.dir_for(repo, pull, workspace);
        if dir.exists() {
            Ok(dir)
        } else {
            Err(WorkingDirError::NotExist(dir))
        }
    }

    fn has_diverged(&self, _path: &Path) -> bool {
        self.diverged.load(Ordering::SeqCst)
    }

    fn delete(&self, repo: &Repo, pull: &PullRequest) -> Result<()> {
        let dir = self
            .root
            .path()
            .join("repos")
            .join(&repo.full_name)
            .join(pull.num.to_string());
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// [`DefaultWorkingDirLocker`] that counts acquisitions and releases.
#[derive(Default)]
pub struct CountingLocker {
    inner: DefaultWorkingDirLocker,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl CountingLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// The shared lock table, for probing from inside a running step.
    pub fn table(&self) -> DefaultWorkingDirLocker {
        self.inner.clone()
    }
}

impl WorkingDirLocker for CountingLocker {
    fn try_lock(
        &self,
        repo_full_name: &str,
        pull_num: u64,
        workspace: &str,
    ) -> Result<WorkingDirLock, LockError> {
        let inner = self.inner.try_lock(repo_full_name, pull_num, workspace)?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = Arc::clone(&self.released);
        Ok(WorkingDirLock::new(move || {
            inner.release();
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

enum GateVerdict {
    Allow,
    Reject(String),
    Error(String),
}

/// Apply gate with a fixed verdict.
pub struct FakeGate {
    verdict: GateVerdict,
    calls: AtomicUsize,
}

impl FakeGate {
    pub fn allow() -> Self {
        Self::with(GateVerdict::Allow)
    }

    pub fn reject(reason: &str) -> Self {
        Self::with(GateVerdict::Reject(reason.to_string()))
    }

    pub fn error(msg: &str) -> Self {
        Self::with(GateVerdict::Error(msg.to_string()))
    }

    fn with(verdict: GateVerdict) -> Self {
        Self {
            verdict,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ApplyRequirement for FakeGate {
    fn validate_project(
        &self,
        _repo_dir: &Path,
        _ctx: &ProjectCommandContext,
    ) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.verdict {
            GateVerdict::Allow => Ok(None),
            GateVerdict::Reject(reason) => Ok(Some(reason.clone())),
            GateVerdict::Error(msg) => Err(anyhow!(msg.clone())),
        }
    }
}

/// Records every apply notification; optionally fails each send.
#[derive(Default)]
pub struct RecordingWebhooks {
    sent: Mutex<Vec<ApplyResult>>,
    fail: AtomicBool,
}

impl RecordingWebhooks {
    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ApplyResult> {
        locked(&self.sent).clone()
    }
}

impl WebhooksSender for RecordingWebhooks {
    fn send(&self, result: &ApplyResult) -> Result<()> {
        locked(&self.sent).push(result.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("webhook endpoint unavailable"));
        }
        Ok(())
    }
}
