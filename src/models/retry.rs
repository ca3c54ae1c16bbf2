use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Backoff settings shared by connection retries and row rescheduling.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

impl RetryConfig {
    /// Delay before the next automatic attempt of a queue row:
    /// `initial_delay × multiplier^attempts`, capped at `max_delay`.
    pub fn row_backoff(&self, attempts: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.max(1).saturating_pow(attempts);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(delay_ms)
    }

    pub fn next_run_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = self.row_backoff(attempts);
        now + ChronoDuration::milliseconds(delay.as_millis() as i64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
            backoff_multiplier: 2,
        }
    }
}
