//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating `threadgrid.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration `{0}` (expected e.g. \"5ms\", \"5s\", \"1m\")")]
    Duration(String),

    #[error("invalid size `{0}` (expected e.g. \"128M\", \"1G\", \"-1\")")]
    Size(String),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
