//! Diagnostic tracing for the reflector.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. The per-pass status
//! summary is product output and is printed to stdout by the CLI instead.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `reflector=info,warn` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=reflector=debug reflector run --one-shot
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reflector=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
