//! Tracing subscriber setup for the `trag` binary.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! `RUST_LOG` overrides the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tenant_rag={}", "warn", config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let _ = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
}
