//! Minimum spacing between outgoing requests
//!
//! Slots are reserved lock-free: each caller atomically claims the next free
//! slot and sleeps until it arrives, so no lock is held across the wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Enforces a minimum interval between consecutive requests
#[derive(Debug)]
pub struct RequestThrottle {
    min_interval: Duration,
    /// Reference point for slot timestamps
    origin: Instant,
    /// Earliest permitted start of the next request, in nanoseconds since `origin`
    next_slot: AtomicU64,
}

impl RequestThrottle {
    /// Create a throttle; the first request is never delayed
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            origin: Instant::now(),
            next_slot: AtomicU64::new(0),
        }
    }

    /// Configured interval
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a request may be sent, then claim the slot
    ///
    /// Returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let interval = self.min_interval.as_nanos().min(u64::MAX as u128) as u64;
        let now = self.origin.elapsed().as_nanos().min(u64::MAX as u128) as u64;

        let mut slot = now;
        let _ = self
            .next_slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                slot = next.max(now);
                Some(slot.saturating_add(interval))
            });

        let wait = Duration::from_nanos(slot.saturating_sub(now));
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limiting request");
            tokio::time::sleep_until(self.origin + Duration::from_nanos(slot)).await;
        }
        wait
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_request_is_immediate() {
        let throttle = RequestThrottle::new(Duration::from_secs(1));
        assert_eq!(throttle.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_requests_are_spaced() {
        let throttle = RequestThrottle::new(Duration::from_secs(1));
        let start = Instant::now();

        throttle.acquire().await;
        throttle.acquire().await;
        throttle.acquire().await;

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_after_interval_has_passed() {
        let throttle = RequestThrottle::new(Duration::from_millis(100));
        throttle.acquire().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(throttle.acquire().await, Duration::ZERO);
    }
}
