//! Process-wide tracing setup.

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Parse a level name such as `info` or `DEBUG`.
pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}

/// Install a compact fmt subscriber at `level`.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
pub fn init_logging(level: &str) -> Result<(), LoggingError> {
    let default_level = parse_level(level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}
