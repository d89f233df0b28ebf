//! Logging initialization for the bundled runner.
//!
//! The library itself only emits `tracing` events; embedding hosts install
//! whatever subscriber they already use. The runner binary picks between a
//! few formats here.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initializes the subscriber for the runner.
///
/// RUST_LOG takes priority; otherwise `level` applies ("info" when empty).
/// `format` selects "compact", "json" or the default full output.
pub fn init_logging(level: &str, format: &str) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if level.is_empty() {
        EnvFilter::new("info")
    } else {
        EnvFilter::new(level)
    };

    match format {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}
