//! Bounded polling.
//!
//! Every "wait until the platform reaches a state" in the harness is a
//! [`Poller`] loop: fixed interval, hard upper bound, and a probe that either
//! reports a terminal value, reports what it saw so far, or fails. A probe
//! error aborts immediately; only "not yet" is retried.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Terminal state reached.
    Ready(T),
    /// Not there yet; the string describes the current observation.
    Pending(String),
}

/// Fixed-interval, bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(20),
        }
    }
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Probe until `Ready` or the bound elapses.
    ///
    /// The probe always runs at least once, even with a zero timeout.
    pub async fn until<T, F, Fut>(&self, description: &str, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe<T>>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last_observed = match probe().await? {
                Probe::Ready(value) => {
                    debug!(what = description, attempts, elapsed = ?start.elapsed(), "poll satisfied");
                    return Ok(value);
                }
                Probe::Pending(observed) => observed,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::Timeout {
                    description: description.to_string(),
                    elapsed: now - start,
                    last_observed,
                });
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }

    /// Poll a boolean condition.
    pub async fn until_true<F, Fut>(&self, description: &str, mut condition: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.until(description, || {
            let fut = condition();
            async move {
                Ok(if fut.await? {
                    Probe::Ready(())
                } else {
                    Probe::Pending("condition false".to_string())
                })
            }
        })
        .await
    }
}
