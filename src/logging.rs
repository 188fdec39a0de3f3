//! Logging initialization.
//!
//! Installs a `tracing-subscriber` registry filtered by `RUST_LOG`, or by
//! the configured level when `RUST_LOG` is unset. Logs go to stderr so that
//! stdout carries only scan output.

use crate::error::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Must be called at most once per process.
///
/// # Arguments
///
/// * `level` - Default filter directive, e.g. `info` or `layerscan=debug`
/// * `json` - Emit JSON lines instead of human-readable text
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("invalid log level {:?}: {}", level, e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| Error::Config(format!("failed to initialize tracing subscriber: {}", e)))
}
