//! Cancellable bounded polling
//!
//! Provisioners wait for cloud-side state transitions (an instance reaching
//! `running`, a region operation reaching `DONE`) with this helper instead of
//! blocking sleeps, so a caller can abort the wait through its token.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interval and upper bound for a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Time between checks
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Poll `check` until it yields a value, the timeout expires or `cancel` fires.
///
/// The first check runs one interval after the call. `check` returns
/// `Ok(Some(v))` when done, `Ok(None)` to keep waiting; an error ends the
/// wait immediately.
pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { operation: operation.to_string() });
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::Timeout {
                    operation: operation.to_string(),
                    after: policy.timeout,
                });
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { operation: operation.to_string() });
            }
            outcome = check() => outcome?,
        };

        match outcome {
            Some(value) => return Ok(value),
            None => debug!(operation, attempts, "Still waiting"),
        }
    }
}
