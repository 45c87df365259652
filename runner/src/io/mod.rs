//! Side-effecting collaborators of the project command runner.
//!
//! Each concern sits behind a trait so flows can be exercised with fakes; the
//! default implementations here talk to the filesystem, `git` and child
//! processes.

pub mod apply_requirements;
pub mod config;
pub mod context;
pub mod git;
pub mod locker;
pub mod process;
pub mod step_runners;
pub mod webhooks;
pub mod working_dir;
