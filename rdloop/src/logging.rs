//! Development-time tracing.
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//! - **Event log (`io/event_log`)**: Product output in
//!   `<session>/events.jsonl`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbose` selects `info` for this
/// crate and `warn` everywhere else.
///
/// # Example
/// ```bash
/// RUST_LOG=rdloop=debug rdloop run --config rdloop.toml
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,rdloop=info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
