//! Bounded polling primitive for eventually consistent provider state.
//!
//! Cloud APIs acknowledge a request long before its effect is observable.
//! [`poll`] re-runs a probe at a fixed interval until it produces a value or
//! the attempt budget runs out; the caller maps exhaustion onto a
//! domain-specific failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Result of a bounded poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollOutcome<T> {
    /// The probe produced a value before the budget was exhausted.
    Ready(T),
    /// Every attempt was consumed without the probe producing a value.
    TimedOut,
}

/// Runs `probe` once per attempt, up to `max_attempts` times, sleeping
/// `interval` between attempts.
///
/// The probe runs exactly once per attempt and never after the budget is
/// spent; no sleep follows the final attempt. A probe error aborts the poll
/// immediately.
///
/// # Errors
///
/// Propagates the first error returned by `probe`.
pub async fn poll<T, E, P, Fut>(
    max_attempts: u32,
    interval: Duration,
    mut probe: P,
) -> Result<PollOutcome<T>, E>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 1..=max_attempts {
        if let Some(value) = probe().await? {
            return Ok(PollOutcome::Ready(value));
        }
        if attempt < max_attempts {
            sleep(interval).await;
        }
    }
    Ok(PollOutcome::TimedOut)
}
