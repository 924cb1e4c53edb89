//! Tracing setup for hosts embedding the desk.
//!
//! `RUST_LOG` wins when set; otherwise everything logs at `info`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::error::ConfigError;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
    {
        tracing::debug!("Tracing subscriber already set: {e}");
    }
}

/// Log to stderr and to a daily-rotated file under `dir`.
///
/// The returned guard flushes the file writer on drop and must be kept
/// alive for as long as logging is wanted.
pub fn init_tracing_with_file(dir: &Path, file_prefix: &str) -> Result<WorkerGuard, ConfigError> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| ConfigError::ParseError(format!("tracing already initialized: {e}")))?;

    Ok(guard)
}
