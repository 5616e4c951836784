//! Retry backoff
//!
//! Exponential backoff shared by entry setup (`NotReady` retries) and the
//! TCP link's reconnect loop.

use std::time::Duration;

/// Initial retry delay
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Maximum number of retries
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Retry strategy with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectionStrategy {
    /// Current attempt number
    pub attempt: u32,
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Delay before the next attempt
    pub current_delay: Duration,
    /// Delay the strategy starts from and resets to
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl ReconnectionStrategy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            current_delay: initial_delay,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// Reset the strategy
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    /// Check if more attempts are available
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Get next delay with exponential backoff
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;

        // Exponential backoff: double the delay each time
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);

        Some(delay)
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        format!(
            "Attempt {}/{}, next delay: {:?}",
            self.attempt, self.max_attempts, self.current_delay
        )
    }
}
