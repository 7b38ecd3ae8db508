//! Logging bootstrap for processes embedding meshlink.

use crate::{Error, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Parse a log level name (`trace`, `debug`, `info`, `warn`, `error`)
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!("Unknown log level: {}", other))),
    }
}

/// Install the global JSON subscriber at `level`.
///
/// Fails if the level is unknown or a global subscriber is already set.
pub fn init_logging(level: &str) -> Result<()> {
    let level = parse_log_level(level)?;
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install subscriber: {}", e)))?;
    info!("Logging initialized at {}", level);
    Ok(())
}

/// [`init_logging`] with the level from `MESH_LOG_LEVEL` (default: info)
pub fn init_logging_from_env() -> Result<()> {
    let level = std::env::var("MESH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    init_logging(&level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(" warn ").unwrap(), Level::WARN);
        assert!(matches!(parse_log_level("loud"), Err(Error::Config(_))));
    }
}
