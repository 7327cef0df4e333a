//! Tracing/logging initialization.
//!
//! JSON logs with timestamps. `RUST_LOG` wins when set; otherwise the
//! configured level applies.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObservabilityError {
    #[error("unknown log level '{0}' (expected trace, debug, info, warn, error or off)")]
    UnknownLevel(String),
}

/// Parse a plain level name (`trace`..`error`, `off`), case-insensitively.
pub fn parse_level(raw: &str) -> Result<LevelFilter, ObservabilityError> {
    LevelFilter::from_str(raw.trim()).map_err(|_| ObservabilityError::UnknownLevel(raw.to_string()))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_level: &str) -> Result<(), ObservabilityError> {
    let level = parse_level(default_level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_levels_parse() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level(" DEBUG ").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert_eq!(
            parse_level("verbose"),
            Err(ObservabilityError::UnknownLevel("verbose".to_string()))
        );
        assert!(init("loud").is_err());
    }
}
