use std::time::Duration;

pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const RETRY_BASE: Duration = Duration::from_millis(500);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Exponential delay schedule: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next connection attempt.
    pub fn reconnect() -> Self {
        Self::new(RECONNECT_BASE, BACKOFF_CAP)
    }

    /// Delay before a failed transfer job runs again.
    pub fn job_retry() -> Self {
        Self::new(RETRY_BASE, BACKOFF_CAP)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        Duration::from_millis(base_ms.saturating_mul(1u64 << shift).min(max_ms))
    }
}
