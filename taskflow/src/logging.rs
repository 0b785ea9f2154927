//! Tracing setup for the CLI and embedding applications.
//!
//! Diagnostics only: nothing the engine produces is written through here.
//! Credentials in clone URLs are redacted at the source (see
//! [`crate::io::git::redact_credentials`]) before they reach any event.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` if unset. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=taskflow=debug taskflow check task.toml
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
