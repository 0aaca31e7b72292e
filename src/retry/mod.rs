//! Bounded retry executor.
//!
//! Runs a fallible operation up to `max_attempts` times. Errors that report
//! themselves as permanent ([`Retryable::is_retryable`] returning `false`)
//! end the loop immediately; anything else is retried until the bound is
//! reached, and the last error is returned.
//!
//! Retries are immediate by default. A [`Backoff`] can be configured to
//! sleep between attempts; exponential backoff uses `backon`.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;

/// Default attempt bound for inbound message handling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Classifies errors as transient or permanent.
pub trait Retryable {
    /// Returns false when retrying cannot help.
    fn is_retryable(&self) -> bool;
}

/// Delay between failed attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    Immediate,
    /// Constant delay.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Exponential delay, capped.
    Exponential {
        /// First delay in milliseconds.
        min_delay_ms: u64,
        /// Delay cap in milliseconds.
        max_delay_ms: u64,
        /// Randomize delays to spread out competing consumers.
        #[serde(default)]
        jitter: bool,
    },
}

impl Backoff {
    /// Delays to sleep after each failed attempt, in order.
    fn delays(&self, max_attempts: u32) -> Box<dyn Iterator<Item = Duration> + Send> {
        match *self {
            Backoff::Immediate => Box::new(std::iter::repeat(Duration::ZERO)),
            Backoff::Fixed { delay_ms } => {
                Box::new(std::iter::repeat(Duration::from_millis(delay_ms)))
            }
            Backoff::Exponential {
                min_delay_ms,
                max_delay_ms,
                jitter,
            } => {
                let max_delay = Duration::from_millis(max_delay_ms);
                let mut builder = ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(min_delay_ms))
                    .with_max_delay(max_delay)
                    .with_max_times(max_attempts as usize);
                if jitter {
                    builder = builder.with_jitter();
                }
                Box::new(builder.build().chain(std::iter::repeat(max_delay)))
            }
        }
    }
}

/// Attempt bound plus backoff.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Immediate,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` immediate attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Immediate,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt bound
    /// is reached.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delays = self.backoff.delays(max_attempts);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
                Err(_) => {
                    let delay = delays.next().unwrap_or(Duration::ZERO);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
