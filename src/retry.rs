//! Bounded fixed-delay retry policy shared by ensure steps, readiness
//! probes and the trust verifier.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Fixed number of attempts separated by a fixed delay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Waits for identity and networking control planes to converge.
    pub const PROPAGATION: Self = Self::new(10, Duration::from_secs(2));

    /// Creates a policy; zero attempts is treated as one.
    #[must_use]
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            delay,
        }
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn attempts(self) -> u32 {
        self.attempts
    }

    /// Delay between attempts.
    #[must_use]
    pub const fn delay(self) -> Duration {
        self.delay
    }

    /// Total time spent sleeping when every attempt is used.
    #[must_use]
    pub const fn budget(self) -> Duration {
        self.delay.saturating_mul(self.attempts.saturating_sub(1))
    }

    /// Calls `probe` with the 1-based attempt number until it yields a
    /// value, sleeping between attempts. Returns `Ok(None)` once the attempt
    /// budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `probe`; errors are not retried.
    pub async fn poll<T, E, F, Fut>(self, operation: &str, mut probe: F) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        for attempt in 1..=self.attempts {
            if let Some(value) = probe(attempt).await? {
                return Ok(Some(value));
            }
            if attempt < self.attempts {
                debug!(
                    operation,
                    attempt,
                    attempts = self.attempts,
                    delay_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX),
                    "not ready yet; retrying"
                );
                sleep(self.delay).await;
            }
        }
        Ok(None)
    }
}
