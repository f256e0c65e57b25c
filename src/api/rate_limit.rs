//! Token bucket shared by every request a gateway makes.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Exchange weight budget per minute.
pub const MAX_REQUESTS_PER_MINUTE: u32 = 1200;
/// Fraction of the budget actually used.
pub const RATE_LIMIT_BUFFER: f64 = 0.8;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last: now,
        }
    }

    /// Take one token, or report how long until one is available.
    fn take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }
}

/// Async token bucket; `acquire` blocks the caller until a token is free.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, per: Duration, buffer: f64) -> Self {
        let capacity = (f64::from(max_requests) * buffer).max(1.0);
        let refill = capacity / per.as_secs_f64().max(f64::EPSILON);
        Self {
            bucket: Mutex::new(Bucket::new(capacity, refill, Instant::now())),
        }
    }

    /// Limiter with the exchange defaults (1200/min at 80%).
    pub fn exchange_default() -> Self {
        Self::new(
            MAX_REQUESTS_PER_MINUTE,
            Duration::from_secs(60),
            RATE_LIMIT_BUFFER,
        )
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.take(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_drains_then_waits() {
        let start = Instant::now();
        let mut bucket = Bucket::new(3.0, 1.0, start);
        assert!(bucket.take(start).is_ok());
        assert!(bucket.take(start).is_ok());
        assert!(bucket.take(start).is_ok());

        let wait = bucket.take(start).unwrap_err();
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = Bucket::new(2.0, 2.0, start);
        bucket.take(start).unwrap();
        bucket.take(start).unwrap();
        assert!(bucket.take(start).is_err());
        assert!(bucket.take(start + Duration::from_millis(600)).is_ok());
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = Bucket::new(2.0, 10.0, start);
        let later = start + Duration::from_secs(60);
        assert!(bucket.take(later).is_ok());
        assert!(bucket.take(later).is_ok());
        assert!(bucket.take(later).is_err());
    }

    #[tokio::test]
    async fn test_acquire_within_budget_is_immediate() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60), 0.8);
        let started = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
