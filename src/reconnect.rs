use std::time::Duration;

pub const INITIAL_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_DELAY: Duration = Duration::from_millis(30000);

/// Exponential reconnect backoff. Never gives up.
#[derive(Debug, Default, Clone)]
pub struct Backoff {
    attempts: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// `min(30 s, 1 s * 2^attempts)`
    pub fn delay_for(attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let ms = (INITIAL_DELAY.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(ms).min(MAX_DELAY)
    }

    /// Delay for the current attempt; counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Self::delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
