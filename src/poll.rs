//! Interval polling with a deadline and cancellation
//!
//! [`Poller::poll`] invokes an action once per interval until it yields a
//! value, fails, runs out of time or is cancelled. The first invocation
//! happens one interval after the call, never immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::humanize;
use crate::{Error, Result};

/// Polling interval and overall timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    /// Time between two invocations
    pub interval: Duration,
    /// Time after which polling gives up
    pub timeout: Duration,
}

impl Poller {
    /// Create a poller, rejecting a zero interval or timeout and an interval
    /// longer than the timeout
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::validation("polling interval must be greater than zero"));
        }
        if timeout.is_zero() {
            return Err(Error::validation("polling timeout must be greater than zero"));
        }
        if interval > timeout {
            return Err(Error::validation(format!(
                "polling interval {} exceeds polling timeout {}",
                humanize(interval),
                humanize(timeout)
            )));
        }
        Ok(Self { interval, timeout })
    }

    /// Poll `action` until it returns `Ok(Some(_))`
    ///
    /// - `Ok(None)` means not yet, try again on the next tick
    /// - `Err(_)` aborts immediately, without retry
    /// - [`Error::Timeout`] once elapsed time exceeds the timeout, so a tick
    ///   landing exactly on the deadline still runs
    /// - cancellation yields [`Error::Cancelled`] and wins over both
    pub async fn poll<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut action: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            operation,
            interval = %humanize(self.interval),
            timeout = %humanize(self.timeout),
            "start polling"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(operation, "polling cancelled");
                    return Err(Error::cancelled(operation));
                }
                tick = ticker.tick() => {
                    if tick > deadline {
                        return Err(Error::timeout(operation, self.timeout));
                    }
                    if let Some(value) = action().await? {
                        trace!(operation, elapsed = ?start.elapsed(), "polling done");
                        return Ok(value);
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(Error::timeout(operation, self.timeout));
                }
            }
        }
    }
}
