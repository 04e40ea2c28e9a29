// Exponential backoff policy

//! Exponential backoff for retry loops
//!
//! Tracks a monotonically growing delay capped at a configured maximum and
//! reset on success. Retry loops call [`Backoff::wait`] after each attempt:
//! on failure it sleeps the grown delay, on success it returns immediately
//! and resets. There is no retry limit; loops using this policy retry until
//! they succeed or the process exits.

use std::time::Duration;

/// Delay before the first retry.
const INITIAL_DELAY: Duration = Duration::from_millis(10);

/// Exponential backoff state for a single retry loop.
#[derive(Debug)]
pub struct Backoff {
    name: &'static str,
    delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    /// Create a backoff policy named `name` (used in log output) with the
    /// given delay cap. Tests inject a near-zero cap to keep retries fast.
    pub fn new(name: &'static str, max_delay: Duration) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            max_delay,
        }
    }

    /// Return to the no-delay state after a success.
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    /// Grow the delay for a failure and return how long to sleep before the
    /// next attempt.
    pub fn advance(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            INITIAL_DELAY.min(self.max_delay)
        } else {
            (self.delay * 2).min(self.max_delay)
        };
        self.delay
    }

    /// Observe the outcome of an attempt. On success resets and returns
    /// immediately; on failure sleeps the grown delay.
    pub async fn wait(&mut self, ok: bool) {
        if ok {
            self.reset();
            return;
        }
        let delay = self.advance();
        log::debug!("{}: backing off for {:?}", self.name, delay);
        tokio::time::sleep(delay).await;
    }
}
