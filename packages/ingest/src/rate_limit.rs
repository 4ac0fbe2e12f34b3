//! Caps the number of in-flight calls to the remote source.
//!
//! Independent of the worker pool size: a run may have more workers than
//! permits, in which case the surplus workers wait here.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::IngestError;

/// Counting semaphore shared by every worker of one run.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
}

/// Held while a remote call is in flight. Released on drop.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_concurrent` calls at once.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Validation`] if `max_concurrent` is 0.
    pub fn new(max_concurrent: usize) -> Result<Self, IngestError> {
        if max_concurrent == 0 {
            return Err(IngestError::validation("max_concurrent must be at least 1"));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        })
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a permit.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] if the semaphore has been closed.
    pub async fn acquire(&self) -> Result<RatePermit, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        Ok(RatePermit { _permit: permit })
    }

    /// Runs `fut` while holding a permit.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] if the semaphore has been closed.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, AcquireError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn zero_permits_is_rejected() {
        assert!(matches!(
            RateLimiter::new(0),
            Err(IngestError::Validation { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_in_flight() {
        let limiter = RateLimiter::new(3).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    limiter
                        .run(async {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(limiter.available_permits(), 3);
    }

    #[tokio::test]
    async fn releases_permit_on_error() {
        let limiter = RateLimiter::new(1).unwrap();
        let result: Result<Result<(), String>, _> =
            limiter.run(async { Err("boom".to_string()) }).await;
        assert!(result.unwrap().is_err());
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn releases_permit_on_cancel() {
        let limiter = RateLimiter::new(1).unwrap();
        let held = limiter.clone();
        let task = tokio::spawn(async move {
            held.run(tokio::time::sleep(Duration::from_secs(60))).await
        });

        while limiter.available_permits() == 1 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(limiter.available_permits(), 1);
    }

    fn explode() {
        panic!("source blew up");
    }

    #[tokio::test]
    async fn releases_permit_on_panic() {
        let limiter = RateLimiter::new(1).unwrap();
        let held = limiter.clone();
        let task = tokio::spawn(async move {
            held.run(async { explode() }).await
        });
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(limiter.available_permits(), 1);
    }
}
