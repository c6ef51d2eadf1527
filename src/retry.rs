//! Fixed-interval retry and poll-for-condition primitives.
//!
//! Both exist because the host editor exposes state the core cannot
//! subscribe to (command registries that populate late, dialogs that appear
//! asynchronously), so the only portable observer is a bounded poll.

use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Calls `attempt` until it yields a value, sleeping `interval` between
/// tries, and gives up after `max_attempts` calls.
pub async fn retry_until<T, F>(interval: Duration, max_attempts: u32, mut attempt: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    for round in 0..max_attempts {
        if let Some(value) = attempt() {
            return Some(value);
        }
        if round + 1 < max_attempts {
            sleep(interval).await;
        }
    }
    None
}

/// Polls `condition` every `interval` until it holds or `timeout` elapses.
/// The condition is checked once before the first sleep, so an
/// already-true condition resolves without waiting.
pub async fn poll_for<F>(interval: Duration, timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}
