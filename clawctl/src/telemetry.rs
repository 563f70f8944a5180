//! Telemetry initialization: structured logging via tracing-subscriber.
//!
//! Log verbosity follows `RUST_LOG`; without it the default filter is `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber. Safe to call once per process; a second
/// call (e.g. from tests) is a no-op error that is swallowed.
pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
