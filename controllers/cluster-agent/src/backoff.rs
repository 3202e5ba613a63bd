//! # Exponential Backoff
//!
//! Provides a capped exponential backoff with jitter for watch and discovery
//! retries.
//!
//! The delay doubles (by default) for a fixed number of steps and then stays
//! at the last value. Jitter spreads reconnects of many watches (or many
//! replicas) after an API server restart.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay
    initial: Duration,
    /// Multiplier applied per step
    factor: u32,
    /// Number of growth steps before the delay stops increasing
    steps: u32,
    /// Extra random delay as a fraction of the base delay (0.1 = up to +10%)
    jitter: f64,
    /// Delays handed out since the last reset
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff
    ///
    /// # Arguments
    ///
    /// * `initial` - First delay
    /// * `factor` - Growth factor per step (typically 2)
    /// * `steps` - Number of distinct delays before capping (1s with 5 steps: 1s, 2s, 4s, 8s, 16s, 16s, ...)
    /// * `jitter` - Random extra delay as a fraction of the base delay
    #[must_use]
    pub fn new(initial: Duration, factor: u32, steps: u32, jitter: f64) -> Self {
        Self {
            initial,
            factor: factor.max(1),
            steps: steps.max(1),
            jitter: jitter.max(0.0),
            attempt: 0,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let base = Self::calculate_for_attempt(self.attempt, self.initial, self.factor, self.steps);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..self.jitter);
            base.mul_f64(1.0 + extra)
        } else {
            base
        }
    }

    /// Number of delays handed out since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Calculate the base (unjittered) delay for an attempt number (stateless)
    ///
    /// # Arguments
    ///
    /// * `attempt` - Zero-based attempt number
    /// * `initial` - First delay
    /// * `factor` - Growth factor per step
    /// * `steps` - Number of distinct delays before capping
    #[must_use]
    pub fn calculate_for_attempt(attempt: u32, initial: Duration, factor: u32, steps: u32) -> Duration {
        let exponent = attempt.min(steps.saturating_sub(1));
        let multiplier = factor.saturating_pow(exponent);
        initial.saturating_mul(multiplier)
    }
}
