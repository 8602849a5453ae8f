use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Interval, MissedTickBehavior};

/// Shared throttle for all S3 calls to respect provider-wide RPS and concurrency limits.
/// Multipart parts of every in-flight batch draw from the same pool.
#[derive(Clone, Debug)]
pub struct S3Throttle {
    permits: Arc<Semaphore>,
    interval: Arc<Mutex<Interval>>,
}

impl S3Throttle {
    /// Create a new throttle with the given max concurrency and requests-per-second limit.
    /// `max_rps == 0` disables request spacing.
    #[must_use]
    pub fn new(max_concurrency: usize, max_rps: u32) -> Self {
        let spacing = if max_rps == 0 {
            Duration::from_millis(1)
        } else {
            Duration::from_secs_f64(1.0 / f64::from(max_rps)).max(Duration::from_millis(1))
        };

        let mut interval = time::interval(spacing);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            interval: Arc::new(Mutex::new(interval)),
        }
    }

    /// Wait for both a rate slot and a concurrency slot. Hold the returned permit for the
    /// duration of the S3 call.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        {
            let mut interval = self.interval.lock().await;
            interval.tick().await;
        }

        self.permits.clone().acquire_owned().await
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let throttle = S3Throttle::new(2, 0);
        let first = throttle.acquire().await.unwrap();
        let _second = throttle.acquire().await.unwrap();
        assert_eq!(throttle.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(20), throttle.acquire()).await;
        assert!(blocked.is_err());

        drop(first);
        assert_eq!(throttle.available(), 1);
        assert!(throttle.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn zero_concurrency_still_allows_one_call() {
        let throttle = S3Throttle::new(0, 1000);
        assert!(throttle.acquire().await.is_ok());
    }
}
