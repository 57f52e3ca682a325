//! Retry with randomized exponential backoff

use std::thread;
use std::time::Duration;

use log::warn;

use super::ApiError;

/// Retries a single remote call on transient failures
///
/// Network failures are retried a bounded number of times; rate-limit
/// responses are retried for as long as the server keeps answering with
/// them, starting from its retry-after hint. Every other error is returned
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed for network failures
    network_retries: u32,
    /// Minimum delay, in units
    floor_units: u64,
    /// Maximum delay, in units
    ceiling_units: u64,
    /// Length of one delay unit
    unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_retries: 3,
            floor_units: 30,
            ceiling_units: 15 * 60,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the length of one delay unit (tests use milliseconds or zero)
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Run `op`, retrying transient failures
    ///
    /// `what` names the call in log lines.
    pub fn call<T, F>(&self, what: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Result<T, ApiError>,
    {
        let mut attempt: u32 = 1;
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let base = match &err {
                ApiError::Network { .. } if attempt <= self.network_retries => self.floor_units,
                ApiError::RateLimited { retry_after, .. } => *retry_after,
                _ => return Err(err),
            };

            let units = self.delay_units(base, attempt, rand::random::<f64>());
            let delay = self.unit.saturating_mul(units as u32);
            match &err {
                ApiError::RateLimited { .. } => warn!(
                    "{}: Slack reported Too Many Requests (retrying in {} units, attempt {})",
                    what, units, attempt
                ),
                _ => warn!(
                    "{}: Slack aborted or timed out the request: {} (retrying in {} units, attempt {})",
                    what, err, units, attempt
                ),
            }
            thread::sleep(delay);
            attempt += 1;
        }
    }

    /// `base * 2^(attempt * jitter)`, clamped to `[floor, ceiling]`
    pub fn delay_units(&self, base: u64, attempt: u32, jitter: f64) -> u64 {
        let scaled = base as f64 * 2f64.powf(f64::from(attempt) * jitter.clamp(0.0, 1.0));
        let units = if scaled.is_finite() {
            scaled as u64
        } else {
            self.ceiling_units
        };
        units.clamp(self.floor_units, self.ceiling_units)
    }
}
