//! Pull-request level project locks layered over a [`ProjectCommandRunner`].
//!
//! The working-directory lock only guards a single invocation. A project lock
//! spans invocations: plan takes it and it stays held until the plan is applied
//! or discarded, so a second pull request cannot plan the same project in the
//! meantime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::error::{LockError, ProjectError};
use crate::core::result::{CommandName, Outcome, ProjectResult};
use crate::core::types::{ProjectCommandContext, PullRequest, User};
use crate::project::ProjectCommandRunner;

/// Outcome of a project lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectLockAttempt {
    Acquired { lock_key: String },
    /// Another pull request holds the lock; `reason` is shown to the user.
    Held { reason: String },
}

/// Holds project locks across command invocations.
pub trait ProjectLocker: Send + Sync {
    fn try_lock(
        &self,
        pull: &PullRequest,
        user: &User,
        workspace: &str,
        repo_rel_dir: &str,
    ) -> Result<ProjectLockAttempt>;

    /// Release `lock_key`. Releasing a lock that is not held is not an error.
    fn unlock(&self, lock_key: &str) -> Result<()>;
}

/// Builds the URL of the page that shows a lock.
pub trait LockUrlGenerator: Send + Sync {
    fn generate_lock_url(&self, lock_key: &str) -> String;
}

/// `<repo>/<dir>/<workspace>`, with `dir` normalized so `""`, `.` and `./` agree.
pub fn project_lock_key(repo_full_name: &str, repo_rel_dir: &str, workspace: &str) -> String {
    let dir = repo_rel_dir.trim_start_matches("./").trim_end_matches('/');
    let dir = if dir.is_empty() { "." } else { dir };
    format!("{repo_full_name}/{dir}/{workspace}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLock {
    pub pull_num: u64,
    pub username: String,
    pub workspace: String,
}

/// In-process project locks. A pull request may re-take its own locks.
#[derive(Debug, Default)]
pub struct MemoryProjectLocker {
    locks: Mutex<HashMap<String, ProjectLock>>,
}

impl MemoryProjectLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `lock_key`, if any.
    pub fn holder(&self, lock_key: &str) -> Option<ProjectLock> {
        self.locks.lock().ok()?.get(lock_key).cloned()
    }
}

impl ProjectLocker for MemoryProjectLocker {
    fn try_lock(
        &self,
        pull: &PullRequest,
        user: &User,
        workspace: &str,
        repo_rel_dir: &str,
    ) -> Result<ProjectLockAttempt> {
        let lock_key = project_lock_key(&pull.base_repo.full_name, repo_rel_dir, workspace);
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("project lock table poisoned"))?;

        let holder = locks.get(&lock_key).map(|existing| existing.pull_num);
        if let Some(n) = holder.filter(|n| *n != pull.num) {
            debug!(%lock_key, holder = n, "project locked by another pull");
            return Ok(ProjectLockAttempt::Held {
                reason: format!(
                    "This project is currently locked by an unapplied plan from pull #{n}. To continue, delete the lock from #{n} or apply that plan and merge the pull request.\n\nOnce the lock is released, re-run plan here."
                ),
            });
        }

        locks.insert(
            lock_key.clone(),
            ProjectLock {
                pull_num: pull.num,
                username: user.username.clone(),
                workspace: workspace.to_string(),
            },
        );
        debug!(%lock_key, "project lock acquired");
        Ok(ProjectLockAttempt::Acquired { lock_key })
    }

    fn unlock(&self, lock_key: &str) -> Result<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("project lock table poisoned"))?;
        if locks.remove(lock_key).is_some() {
            debug!(%lock_key, "project lock released");
        }
        Ok(())
    }
}

/// `<base>/lock?id=<escaped key>`.
#[derive(Debug, Clone)]
pub struct BasicLockUrlGenerator {
    base: Url,
}

impl BasicLockUrlGenerator {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("parse lock url base {base:?}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("lock url base {base} cannot hold a path"));
        }
        Ok(Self { base })
    }
}

impl LockUrlGenerator for BasicLockUrlGenerator {
    fn generate_lock_url(&self, lock_key: &str) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("lock");
        }
        url.query_pairs_mut().append_pair("id", lock_key);
        url.into()
    }
}

/// Decorates a runner with project locking.
///
/// `plan`, `policy_check`, `apply` and `version` take the project lock before
/// delegating; a lock held by another pull becomes a failure result. Plan
/// releases the lock again when it does not succeed. `approve_policies`
/// delegates directly.
pub struct ProjectCommandLocker<R> {
    runner: R,
    locker: Arc<dyn ProjectLocker>,
    lock_url_generator: Arc<dyn LockUrlGenerator>,
}

impl<R: ProjectCommandRunner> ProjectCommandLocker<R> {
    pub fn new(
        runner: R,
        locker: Arc<dyn ProjectLocker>,
        lock_url_generator: Arc<dyn LockUrlGenerator>,
    ) -> Self {
        Self {
            runner,
            locker,
            lock_url_generator,
        }
    }

    pub fn inner(&self) -> &R {
        &self.runner
    }

    /// URL of the project lock `ctx` runs under.
    pub fn lock_url(&self, ctx: &ProjectCommandContext) -> String {
        let key = project_lock_key(
            &ctx.pull.base_repo.full_name,
            &ctx.repo_rel_dir,
            &ctx.workspace,
        );
        self.lock_url_generator.generate_lock_url(&key)
    }

    /// Take the project lock, or produce the result to return instead.
    fn acquire(
        &self,
        command: CommandName,
        ctx: &ProjectCommandContext,
    ) -> Result<String, ProjectResult> {
        let attempt = self
            .locker
            .try_lock(&ctx.pull, &ctx.user, &ctx.workspace, &ctx.repo_rel_dir)
            .context("acquire project lock");
        let outcome = match attempt {
            Ok(ProjectLockAttempt::Acquired { lock_key }) => return Ok(lock_key),
            Ok(ProjectLockAttempt::Held { reason }) => {
                info!(%command, "project locked by another pull request");
                Outcome::Failure(reason)
            }
            Err(err) => Outcome::Error(ProjectError::Lock(LockError::Backend(err))),
        };
        Err(ProjectResult::new(command, ctx, outcome))
    }

    fn release(&self, lock_key: &str) {
        if let Err(err) = self.locker.unlock(lock_key) {
            warn!(%lock_key, err = %format!("{err:#}"), "releasing project lock failed");
        }
    }
}

impl<R: ProjectCommandRunner> ProjectCommandRunner for ProjectCommandLocker<R> {
    fn plan(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        let lock_key = match self.acquire(CommandName::Plan, ctx) {
            Ok(key) => key,
            Err(result) => return result,
        };
        let mut result = self.runner.plan(ctx);
        match &mut result.outcome {
            Outcome::Plan(success) => {
                success.lock_url = Some(self.lock_url_generator.generate_lock_url(&lock_key));
            }
            _ => self.release(&lock_key),
        }
        result
    }

    fn policy_check(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        let lock_key = match self.acquire(CommandName::PolicyCheck, ctx) {
            Ok(key) => key,
            Err(result) => return result,
        };
        // A failed policy check keeps the lock until policies are approved.
        let mut result = self.runner.policy_check(ctx);
        if let Outcome::PolicyCheck(success) = &mut result.outcome {
            success.lock_url = Some(self.lock_url_generator.generate_lock_url(&lock_key));
        }
        result
    }

    fn apply(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        if let Err(result) = self.acquire(CommandName::Apply, ctx) {
            return result;
        }
        self.runner.apply(ctx)
    }

    fn approve_policies(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        self.runner.approve_policies(ctx)
    }

    fn version(&self, ctx: &ProjectCommandContext) -> ProjectResult {
        if let Err(result) = self.acquire(CommandName::Version, ctx) {
            return result;
        }
        self.runner.version(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::core::result::{PlanSuccess, PolicyCheckSuccess};
    use crate::core::types::Repo;

    #[derive(Default)]
    struct StubRunner {
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubRunner {
        fn outcome(&self, success: Outcome) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Outcome::Error(ProjectError::NotCloned)
            } else {
                success
            }
        }
    }

    impl ProjectCommandRunner for StubRunner {
        fn plan(&self, ctx: &ProjectCommandContext) -> ProjectResult {
            let outcome = self.outcome(Outcome::Plan(PlanSuccess::default()));
            ProjectResult::new(CommandName::Plan, ctx, outcome)
        }

        fn policy_check(&self, ctx: &ProjectCommandContext) -> ProjectResult {
            let outcome = self.outcome(Outcome::PolicyCheck(PolicyCheckSuccess::default()));
            ProjectResult::new(CommandName::PolicyCheck, ctx, outcome)
        }

        fn apply(&self, ctx: &ProjectCommandContext) -> ProjectResult {
            let outcome = self.outcome(Outcome::Apply("applied".to_string()));
            ProjectResult::new(CommandName::Apply, ctx, outcome)
        }

        fn approve_policies(&self, ctx: &ProjectCommandContext) -> ProjectResult {
            let outcome = self.outcome(Outcome::PolicyCheck(PolicyCheckSuccess::default()));
            ProjectResult::new(CommandName::PolicyCheck, ctx, outcome)
        }

        fn version(&self, ctx: &ProjectCommandContext) -> ProjectResult {
            let outcome = self.outcome(Outcome::Version("v1".to_string()));
            ProjectResult::new(CommandName::Version, ctx, outcome)
        }
    }

    fn ctx(pull_num: u64) -> ProjectCommandContext {
        let mut ctx = ProjectCommandContext {
            repo_rel_dir: ".".to_string(),
            workspace: "default".to_string(),
            ..ProjectCommandContext::default()
        };
        ctx.pull.num = pull_num;
        ctx.pull.base_repo = Repo::new("acme/infra", "");
        ctx
    }

    fn decorated(
        runner: StubRunner,
    ) -> (ProjectCommandLocker<StubRunner>, Arc<MemoryProjectLocker>) {
        let locker = Arc::new(MemoryProjectLocker::new());
        let urls = Arc::new(BasicLockUrlGenerator::new("http://localhost:4141").expect("url"));
        (
            ProjectCommandLocker::new(runner, locker.clone(), urls),
            locker,
        )
    }

    #[test]
    fn lock_key_normalizes_dir() {
        assert_eq!(project_lock_key("a/b", "", "default"), "a/b/./default");
        assert_eq!(project_lock_key("a/b", "./", "default"), "a/b/./default");
        assert_eq!(project_lock_key("a/b", "./net/", "ws"), "a/b/net/ws");
    }

    #[test]
    fn lock_url_escapes_key() {
        let urls = BasicLockUrlGenerator::new("https://ci.example.com/runner/").expect("url");
        assert_eq!(
            urls.generate_lock_url("acme/infra/./default"),
            "https://ci.example.com/runner/lock?id=acme%2Finfra%2F.%2Fdefault"
        );
    }

    #[test]
    fn lock_url_base_must_be_hierarchical() {
        assert!(BasicLockUrlGenerator::new("mailto:ops@example.com").is_err());
        assert!(BasicLockUrlGenerator::new("not a url").is_err());
    }

    #[test]
    fn memory_locker_is_reentrant_for_same_pull() {
        let locker = MemoryProjectLocker::new();
        let c = ctx(1);
        let first = locker
            .try_lock(&c.pull, &c.user, "default", ".")
            .expect("lock");
        let again = locker
            .try_lock(&c.pull, &c.user, "default", ".")
            .expect("lock");
        assert_eq!(first, again);

        let other = ctx(2);
        let held = locker
            .try_lock(&other.pull, &other.user, "default", ".")
            .expect("lock");
        assert!(matches!(held, ProjectLockAttempt::Held { reason } if reason.contains("pull #1")));
    }

    #[test]
    fn successful_plan_keeps_lock_and_sets_url() {
        let (runner, locker) = decorated(StubRunner::default());
        let result = runner.plan(&ctx(1));

        let success = result.plan_success().expect("plan success");
        assert_eq!(
            success.lock_url.as_deref(),
            Some("http://localhost:4141/lock?id=acme%2Finfra%2F.%2Fdefault")
        );
        assert_eq!(
            locker.holder("acme/infra/./default").map(|l| l.pull_num),
            Some(1)
        );
    }

    #[test]
    fn failed_plan_releases_lock() {
        let (runner, locker) = decorated(StubRunner {
            fail: true,
            ..StubRunner::default()
        });
        let result = runner.plan(&ctx(1));
        assert!(result.error().is_some());
        assert_eq!(locker.holder("acme/infra/./default"), None);
    }

    #[test]
    fn held_lock_fails_without_delegating() {
        let (runner, _locker) = decorated(StubRunner::default());
        runner.plan(&ctx(1));

        let result = runner.apply(&ctx(2));
        assert!(result.failure().expect("failure").contains("pull #1"));
        assert_eq!(result.command, CommandName::Apply);
        assert_eq!(runner.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn approve_policies_skips_project_lock() {
        let (runner, _locker) = decorated(StubRunner::default());
        runner.plan(&ctx(1));

        let result = runner.approve_policies(&ctx(2));
        assert!(result.is_successful());
    }

    #[test]
    fn policy_check_sets_lock_url() {
        let (runner, _locker) = decorated(StubRunner::default());
        let result = runner.policy_check(&ctx(3));
        assert!(
            result
                .policy_check_success()
                .and_then(|s| s.lock_url.as_deref())
                .is_some()
        );
        assert_eq!(
            runner.lock_url(&ctx(3)),
            "http://localhost:4141/lock?id=acme%2Finfra%2F.%2Fdefault"
        );
    }
}
