// Exponential backoff (1s to 60s) for retryable IO errors: the master's
// accept loops and the worker's reconnect loop.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Minimum backoff delay.
const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Multiplier for exponential growth.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Exponential backoff throttler.
///
/// Each call to `increment_and_wait` doubles the delay (capped at 60s).
/// Calling `reset` returns the delay to 1s.
pub struct Backoff {
    current_delay: Duration,
}

impl Backoff {
    /// Create a new `Backoff` starting at the minimum delay.
    pub fn new() -> Self {
        Self {
            current_delay: MIN_BACKOFF,
        }
    }

    /// Reset the delay to the minimum.
    pub fn reset(&mut self) {
        self.current_delay = MIN_BACKOFF;
    }

    /// Returns the current delay without incrementing.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Increment the delay and sleep for the current period.
    ///
    /// Returns `true` if the delay completed normally, `false` if cancelled.
    pub async fn increment_and_wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.current_delay;

        tracing::warn!(
            "Backing off: waiting {:.1}s before retry",
            delay.as_secs_f64()
        );

        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        };

        self.increment();
        completed
    }

    /// Just increment the delay without waiting.
    pub fn increment(&mut self) {
        let next_ms = (self.current_delay.as_millis() as f64 * BACKOFF_MULTIPLIER) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(MAX_BACKOFF);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
