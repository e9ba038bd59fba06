//! Development-time tracing for debugging arena runs.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Command output
//! (tables, JSON, markdown reports) goes to stdout and review artifacts go to
//! the reviews directory; neither is affected by the log filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Compact format on stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=arena=debug arena review run --prompt-file review.md
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
