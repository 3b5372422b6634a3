use std::time::{Duration, Instant};

pub const DEFAULT_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Counts consecutive server-side failures. Once `threshold` is reached the breaker stays open
/// until `cooldown` has passed since the last failure, or until a success resets it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_errors: u32,
    last_error: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold,
            cooldown,
            consecutive_errors: 0,
            last_error: None,
        }
    }

    pub fn record_error(&mut self, now: Instant) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(now);
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.consecutive_errors >= self.threshold
            && self
                .last_error
                .map_or(false, |at| now.saturating_duration_since(at) < self.cooldown)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(DEFAULT_THRESHOLD, DEFAULT_COOLDOWN)
    }
}
