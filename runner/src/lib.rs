//! Per-project command runner for pull-request driven infrastructure workflows.
//!
//! Given a [`ProjectCommandContext`](core::types::ProjectCommandContext), the
//! runner executes `plan`, `policy_check`, `apply`, `approve_policies` or
//! `version` for one project of one pull request and reports a single
//! [`ProjectResult`](core::result::ProjectResult). The crate is split:
//!
//! - **[`core`]**: Pure types: context, steps, results, classified errors.
//!   No I/O.
//! - **[`io`]**: Side-effecting collaborators (checkouts, locks, step
//!   processes, notifications, config files), each behind a trait so flows
//!   can be exercised with fakes.
//!
//! Orchestration modules ([`pipeline`], [`project`], [`locking`]) combine the
//! two into the command flows.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod locking;
pub mod logging;
pub mod pipeline;
pub mod project;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
