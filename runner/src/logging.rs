//! Diagnostic tracing for the runner.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`. It is never
//! part of command output: results are printed to stdout as JSON, and apply
//! notifications from `LogWebhookSender` use the `project_runner::webhook`
//! target so they can be filtered separately.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=project_runner=debug project-runner plan --context ctx.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
