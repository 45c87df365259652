//! Per-invocation mutual exclusion over a working directory.
//!
//! A lock is keyed by `(repo full name, pull number, workspace)` and lives only
//! as long as the [`WorkingDirLock`] guard returned by [`WorkingDirLocker::try_lock`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tracing::debug;

use crate::core::error::LockError;

/// Attempts to take a non-blocking lock on a working directory.
pub trait WorkingDirLocker: Send + Sync {
    /// Returns a guard on success, or [`LockError::Unavailable`] if another
    /// command already holds the key. Never blocks.
    fn try_lock(
        &self,
        repo_full_name: &str,
        pull_num: u64,
        workspace: &str,
    ) -> Result<WorkingDirLock, LockError>;
}

/// Scoped lock. Dropping it runs the release action exactly once.
pub struct WorkingDirLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WorkingDirLock {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for WorkingDirLock {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for WorkingDirLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingDirLock")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Lock key for a working directory.
pub fn working_dir_lock_key(repo_full_name: &str, pull_num: u64, workspace: &str) -> String {
    format!("{repo_full_name}/{pull_num}/{workspace}")
}

/// In-process locker backed by a shared set of held keys.
#[derive(Debug, Clone, Default)]
pub struct DefaultWorkingDirLocker {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DefaultWorkingDirLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.held.lock().map(|held| held.contains(key)).unwrap_or(false)
    }
}

impl WorkingDirLocker for DefaultWorkingDirLocker {
    fn try_lock(
        &self,
        repo_full_name: &str,
        pull_num: u64,
        workspace: &str,
    ) -> Result<WorkingDirLock, LockError> {
        let key = working_dir_lock_key(repo_full_name, pull_num, workspace);
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Backend(anyhow!("working dir lock table poisoned")))?;
        if !held.insert(key.clone()) {
            debug!(%key, "working dir lock unavailable");
            return Err(LockError::Unavailable {
                key,
                workspace: workspace.to_string(),
            });
        }
        debug!(%key, "acquired working dir lock");

        let table = Arc::clone(&self.held);
        Ok(WorkingDirLock::new(move || {
            // A poisoned table still holds our key; recover it so the key is freed.
            let mut held = match table.lock() {
                Ok(held) => held,
                Err(poisoned) => poisoned.into_inner(),
            };
            held.remove(&key);
            debug!(%key, "released working dir lock");
        }))
    }
}
