use std::time::Duration;

/// Exponential backoff: `initial * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// Timeouts and retry bounds for the company service.
///
/// Built once at startup from validated configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePolicy {
    /// Bounds the Mutating phase (all store retries included) and each read.
    pub store_timeout: Duration,
    /// Extra attempts after a `StorageUnavailable` failure.
    pub store_retries: u32,
    pub store_backoff: Backoff,
    /// Bounds a single publish attempt.
    pub emit_timeout: Duration,
    /// Total publish attempts before giving up with `EmitIncomplete`.
    pub emit_attempts: u32,
    pub emit_backoff: Backoff,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(2_000),
            store_retries: 2,
            store_backoff: Backoff::new(Duration::from_millis(25), Duration::from_millis(200)),
            emit_timeout: Duration::from_millis(1_000),
            emit_attempts: 3,
            emit_backoff: Backoff::new(Duration::from_millis(50), Duration::from_secs(1)),
        }
    }
}
