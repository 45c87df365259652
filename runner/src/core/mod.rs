//! Deterministic types shared by the runner core.
//!
//! Core modules must be free of I/O side effects. They describe the invocation,
//! the classified errors and the result shape, and are safe to use in tests
//! without touching the filesystem.

pub mod error;
pub mod result;
pub mod types;
