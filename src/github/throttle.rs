//! Client-side request throttling
//!
//! Token-bucket limiter for outbound API calls: a configurable hourly quota
//! refills the bucket continuously, with a burst allowance bounding how many
//! permits can accumulate. Zero limits disable throttling entirely, so the
//! factory can apply the decoration unconditionally.

use std::sync::Mutex;

use tokio::time::{sleep, Duration, Instant};

/// Outbound rate limiter with an hourly quota and burst capacity
pub struct Throttle {
    bucket: Mutex<Option<Bucket>>,
}

struct Bucket {
    tokens_per_hour: u32,
    capacity: u32,
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let rate = f64::from(self.tokens_per_hour) / 3600.0;
        self.available = (self.available + elapsed * rate).min(f64::from(self.capacity));
        self.last_refill = now;
    }
}

impl Throttle {
    /// A throttle with limiting disabled
    pub fn disabled() -> Self {
        Self {
            bucket: Mutex::new(None),
        }
    }

    /// Install new limits; zeroes disable limiting
    ///
    /// The bucket starts full so configured bursts are available
    /// immediately.
    pub fn set_limits(&self, hourly_tokens: u32, allowed_burst: u32) {
        let Ok(mut bucket) = self.bucket.lock() else {
            return;
        };
        if hourly_tokens == 0 || allowed_burst == 0 {
            *bucket = None;
            return;
        }
        *bucket = Some(Bucket {
            tokens_per_hour: hourly_tokens,
            capacity: allowed_burst,
            available: f64::from(allowed_burst),
            last_refill: Instant::now(),
        });
    }

    /// Whether limiting is currently active
    pub fn is_enabled(&self) -> bool {
        self.bucket.lock().map(|b| b.is_some()).unwrap_or(false)
    }

    /// Wait until a request permit is available
    ///
    /// Returns immediately when limiting is disabled. Safe to call from many
    /// request tasks concurrently; the lock is never held across an await.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let Ok(mut guard) = self.bucket.lock() else {
                    return;
                };
                let Some(bucket) = guard.as_mut() else {
                    return;
                };
                let now = Instant::now();
                bucket.refill(now);
                if bucket.available >= 1.0 {
                    bucket.available -= 1.0;
                    return;
                }
                let rate = f64::from(bucket.tokens_per_hour) / 3600.0;
                Duration::from_secs_f64((1.0 - bucket.available) / rate)
            };
            sleep(wait).await;
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn disabled_throttle_never_waits() {
        let throttle = Throttle::disabled();
        let start = Instant::now();
        for _ in 0..100 {
            throttle.acquire().await;
        }
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limits_disable_throttling() {
        let throttle = Throttle::disabled();
        throttle.set_limits(0, 0);
        assert!(!throttle.is_enabled());
        throttle.set_limits(3600, 0);
        assert!(!throttle.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_available_immediately() {
        let throttle = Throttle::disabled();
        throttle.set_limits(3600, 2);

        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        // 3600 tokens per hour refills one token per second
        let throttle = Throttle::disabled();
        throttle.set_limits(3600, 1);

        throttle.acquire().await;
        let start = Instant::now();
        throttle.acquire().await;
        assert!(Instant::now() - start >= Duration::from_millis(900));
    }
}
