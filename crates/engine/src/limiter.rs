//! Bounded admission for in-process executions.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many executors run at the same time.
///
/// One permit is held for the whole executor call. Closing the limiter makes
/// every waiting and future `acquire` give up, which is how shutdown drains
/// the admission queue.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    admissions: AtomicU64,
}

/// A held concurrency slot; released on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            admissions: AtomicU64::new(0),
        }
    }

    /// Wait for a slot, or give up when `abandon` resolves or the limiter is closed.
    pub async fn acquire_until<F>(&self, abandon: F) -> Option<LimiterPermit>
    where
        F: Future<Output = ()>,
    {
        let permit = tokio::select! {
            biased;
            _ = abandon => return None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok()?,
        };

        self.admissions.fetch_add(1, Ordering::Relaxed);
        Some(LimiterPermit { _permit: permit })
    }

    /// Stop handing out slots. Held permits stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Total number of slots ever handed out.
    pub fn admissions(&self) -> u64 {
        self.admissions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::time::Duration;

    #[tokio::test]
    async fn permits_are_bounded_and_released_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);

        let a = limiter.acquire_until(pending()).await.unwrap();
        let _b = limiter.acquire_until(pending()).await.unwrap();
        assert_eq!(limiter.in_flight(), 2);
        assert_eq!(limiter.available(), 0);

        let third = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.acquire_until(pending()),
        )
        .await;
        assert!(third.is_err(), "third acquire must wait");

        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.acquire_until(pending()).await.is_some());
        assert_eq!(limiter.admissions(), 3);
    }

    #[tokio::test]
    async fn abandon_signal_wins_over_waiting() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire_until(pending()).await.unwrap();

        let result = limiter
            .acquire_until(tokio::time::sleep(Duration::from_millis(20)))
            .await;
        assert!(result.is_none());
        assert_eq!(limiter.admissions(), 1);
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let held = limiter.acquire_until(pending()).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_until(pending()).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        limiter.close();
        assert!(!waiter.await.unwrap());
        assert!(limiter.is_closed());
        drop(held);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(ConcurrencyLimiter::new(0).capacity(), 1);
    }
}
