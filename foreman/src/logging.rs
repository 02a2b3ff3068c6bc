//! Diagnostic tracing for operators and developers.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Interaction log (`io::store`)**: product records of every collaborator
//!   call. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn`, or `warn,foreman=info` when
/// `verbose` is set. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=foreman=debug foreman dispatch
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,foreman=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
