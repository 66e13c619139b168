//! Exponential backoff for operations racing slow external state.

use crate::error::{Error, Result};
use std::time::Duration;

/// Retry policy: attempt, sleep `base`, double, retry, up to `attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Maximum number of attempts (at least one is always made).
    pub attempts: u32,
    /// Delay after the first failure.
    pub base: Duration,
    /// Ceiling for a single delay.
    pub max_delay: Duration,
}

impl Backoff {
    /// Policy with an uncapped doubling delay.
    pub const fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts,
            base,
            max_delay: Duration::MAX,
        }
    }

    /// Policy whose total sleep covers roughly `total`, starting at 50ms
    /// and capping single delays at one second.
    pub fn within(total: Duration) -> Self {
        let mut policy = Self {
            attempts: 1,
            base: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        };
        let mut slept = Duration::ZERO;
        while slept < total {
            slept += policy.delay(policy.attempts - 1);
            policy.attempts += 1;
        }
        policy
    }

    /// Delay after the failed attempt with index `n` (zero-based).
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// On exhaustion the last error is returned wrapped with `what`.
    pub fn retry<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut n = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    n += 1;
                    if n >= attempts {
                        return Err(Error::RetriesExhausted {
                            what: what.to_string(),
                            attempts,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.delay(n - 1);
                    tracing::trace!(what, attempt = n, delay = ?delay, error = %e, "retrying");
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
