//! Outbound bandwidth ceiling shared by all uploads
//!
//! A token bucket where one token is one byte. The bucket holds at most one
//! second worth of tokens, so an idle link cannot bank a large burst. A caller
//! that asks for more than is available takes what is there and sleeps exactly
//! as long as the refill of the remainder needs.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; 0 means unlimited
    limit_bps: u64,
    /// Bytes that may be sent right now
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available = (self.available + elapsed * self.limit_bps as f64).min(self.limit_bps as f64);
    }
}

/// Bandwidth ceiling shared across every concurrent upload
///
/// Cloning is cheap and every clone draws from the same bucket.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

impl SpeedLimiter {
    /// Create a limiter; `None` or `Some(0)` means unlimited
    ///
    /// ```
    /// use edge_uplink::speed_limiter::SpeedLimiter;
    ///
    /// // 1 Mbit/s metered link
    /// let limiter = SpeedLimiter::new(Some(125_000));
    /// assert_eq!(limiter.limit(), Some(125_000));
    /// ```
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let limit_bps = limit_bps.unwrap_or(0);
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                limit_bps,
                available: limit_bps as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Change the ceiling; takes effect for the next acquisition
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        let mut bucket = self.lock();
        let now = Instant::now();
        bucket.refill(now);
        bucket.limit_bps = limit_bps.unwrap_or(0);
        bucket.available = bucket.available.min(bucket.limit_bps as f64);
    }

    /// Current ceiling in bytes per second, `None` when unlimited
    pub fn limit(&self) -> Option<u64> {
        let limit = self.lock().limit_bps;
        (limit > 0).then_some(limit)
    }

    /// Wait until `bytes` may be sent
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes as f64;
        while remaining > 0.0 {
            let wait = {
                let mut bucket = self.lock();
                if bucket.limit_bps == 0 {
                    return;
                }
                let now = Instant::now();
                bucket.refill(now);
                let take = remaining.min(bucket.available);
                bucket.available -= take;
                remaining -= take;
                if remaining <= 0.0 {
                    return;
                }
                // Sleep for the refill of what is still missing, at most a second
                // at a time so a raised limit is picked up.
                let needed = remaining.min(bucket.limit_bps as f64);
                Duration::from_secs_f64(needed / bucket.limit_bps as f64)
                    .clamp(Duration::from_millis(1), Duration::from_secs(1))
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        // A panic while holding the lock cannot leave the bucket inconsistent
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
