//! Tracing/logging setup shared by the binaries.

/// Initialize process-wide tracing with `default_level` as the fallback filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(default_level: &str) -> Result<(), tracing::ObservabilityError> {
    tracing::init(default_level)
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use tracing::{ObservabilityError, parse_level};
