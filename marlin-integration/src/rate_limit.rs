use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Inner {
    capacity: usize,
    tokens: usize,
    interval: Duration,
    last_refill: Instant,
    base_interval: Duration,
    max_interval: Duration,
}

impl Inner {
    fn refill(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= self.interval {
            self.last_refill = now;
            self.tokens = self.capacity;
        }
    }

    fn until_refill(&self) -> Duration {
        self.interval
            .saturating_sub(self.last_refill.elapsed())
            .max(Duration::from_millis(1))
    }
}

/// Token bucket rate limiter allowing `capacity` operations every `interval`, with adaptive
/// backoff on reported quota violations.
///
/// Callers of [`acquire`](Self::acquire) block until a token is available.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
}

impl RateLimiter {
    /// Construct a new [`RateLimiter`] allowing `capacity` operations every `interval`.
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                tokens: capacity,
                interval,
                last_refill: Instant::now(),
                base_interval: interval,
                max_interval: interval * 16,
            })),
        }
    }

    /// Acquire a permit, sleeping through refill windows while the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                inner.refill();
                if inner.tokens > 0 {
                    inner.tokens -= 1;
                    return;
                }
                inner.until_refill()
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Report a rate limit violation to trigger backoff.
    pub async fn report_violation(&self) {
        let mut inner = self.inner.lock().await;
        let next = inner.interval * 2;
        inner.interval = std::cmp::min(next, inner.max_interval);
    }

    /// Reset the current backoff to the base interval.
    pub async fn reset_backoff(&self) {
        let mut inner = self.inner.lock().await;
        inner.interval = inner.base_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_rate_limit_basic() {
        let rl = RateLimiter::new(2, Duration::from_millis(50));
        rl.acquire().await;
        rl.acquire().await;
        let start = Instant::now();
        rl.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_adaptive_backoff() {
        let rl = RateLimiter::new(1, Duration::from_millis(30));
        rl.acquire().await;
        rl.report_violation().await; // double interval
        let start = Instant::now();
        rl.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_reset_backoff() {
        let rl = RateLimiter::new(1, Duration::from_millis(30));
        rl.acquire().await;
        rl.report_violation().await;
        rl.reset_backoff().await;
        let start = Instant::now();
        rl.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(60));
    }
}
