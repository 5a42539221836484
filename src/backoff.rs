/// Exponential backoff policy for reconnection.
///
/// Maps a retry attempt number to the wait before that attempt:
/// `min(initial_delay * multiplier^attempt, max_delay)`. The policy
/// holds no attempt state; the connection state machine owns the
/// retry counter and asks for a delay each time it schedules a retry.
use std::time::Duration;

/// Shortest delay the policy will ever return.
const MIN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
}

impl Backoff {
    /// Zero delays and multipliers are clamped so `delay()` stays positive
    /// and non-decreasing.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        let initial_delay = initial_delay.max(MIN_DELAY);
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: multiplier.max(1),
        }
    }

    /// Wait before retry number `attempt` (0-based).
    /// Saturates at `max_delay` instead of overflowing for large attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.multiplier
            .checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for Backoff {
    /// 1s doubling up to 10s.
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(10_000), 2)
    }
}
