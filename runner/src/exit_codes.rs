//! Stable exit codes for `project-runner` commands.

use crate::core::result::{Outcome, ProjectResult};

/// The command produced a success payload.
pub const OK: i32 = 0;
/// A system fault: bad config or context, lock contention, step error.
pub const ERROR: i32 = 1;
/// An expected rejection, e.g. an apply requirement was not met.
pub const FAILURE: i32 = 2;

/// Exit code for a finished command.
pub fn for_result(result: &ProjectResult) -> i32 {
    match result.outcome {
        Outcome::Failure(_) => FAILURE,
        Outcome::Error(_) => ERROR,
        _ => OK,
    }
}
