//! Tracing subscriber initialization.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber with env-filter support.
///
/// Filtering follows `RUST_LOG` when set and defaults to `info`. Calling this
/// more than once is harmless; later calls are no-ops.
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Same as [`init_telemetry`] but emits JSON lines, for log-shipping setups.
pub fn init_telemetry_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
}
