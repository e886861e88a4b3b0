//! Attempt budget with linear backoff

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Linear retry policy: attempt `n` is followed by a wait of `n * step`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, max_attempts: u32) -> Self {
        Self {
            step,
            max_attempts,
            attempt: 0,
        }
    }

    /// Start the next attempt; `false` once the budget is spent
    pub fn next_attempt(&mut self) -> bool {
        if self.attempt >= self.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    /// Whether another attempt remains after the current one
    pub fn has_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Wait after a failed attempt
    pub async fn wait(&self) {
        let delay = self.current_delay();
        debug!(
            "Waiting {:?} before attempt {}/{}",
            delay,
            self.attempt + 1,
            self.max_attempts
        );
        sleep(delay).await;
    }

    pub fn current_delay(&self) -> Duration {
        self.step * self.attempt
    }

    /// Attempts started so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
