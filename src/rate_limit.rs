//! Upload rate ceiling using a token bucket
//!
//! One [`RateLimiter`] is shared by every block transfer of a file (or of a
//! whole upload session). Blocks acquire tokens for their byte length before
//! they are sent, so concurrent transfers split the configured bandwidth
//! between them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared token-bucket rate limiter
///
/// Cloning is cheap and every clone draws from the same bucket. A limit of
/// zero means unlimited.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Bucket>,
}

struct Bucket {
    /// Bytes per second (0 = unlimited), also the bucket capacity
    limit_bps: AtomicU64,
    /// Bytes that may be sent right now
    tokens: AtomicU64,
    /// Nanoseconds since `origin` at the last refill
    last_refill: AtomicU64,
    origin: Instant,
}

impl RateLimiter {
    /// Create a limiter with the given ceiling in bytes per second
    ///
    /// ```
    /// use pan_transfer::rate_limit::RateLimiter;
    ///
    /// let limited = RateLimiter::new(Some(2 * 1024 * 1024));
    /// assert_eq!(limited.limit(), Some(2 * 1024 * 1024));
    ///
    /// let unlimited = RateLimiter::new(None);
    /// assert_eq!(unlimited.limit(), None);
    /// ```
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        Self {
            inner: Arc::new(Bucket {
                limit_bps: AtomicU64::new(limit),
                tokens: AtomicU64::new(limit),
                last_refill: AtomicU64::new(0),
                origin: Instant::now(),
            }),
        }
    }

    /// Change the ceiling; raising it tops the bucket up by the difference
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        let new_limit = limit_bps.unwrap_or(0);
        let old_limit = self.inner.limit_bps.swap(new_limit, Ordering::SeqCst);
        if new_limit > old_limit {
            self.inner
                .tokens
                .fetch_add(new_limit - old_limit, Ordering::SeqCst);
        }
    }

    /// Current ceiling, `None` when unlimited
    pub fn limit(&self) -> Option<u64> {
        match self.inner.limit_bps.load(Ordering::Relaxed) {
            0 => None,
            limit => Some(limit),
        }
    }

    /// Wait until `bytes` may be sent
    ///
    /// Tokens are consumed as they become available, so a request larger than
    /// the bucket capacity completes after roughly `bytes / limit` seconds.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let limit = self.inner.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }

            self.refill(limit);

            let available = self.inner.tokens.load(Ordering::SeqCst);
            let take = remaining.min(available);
            if take > 0 {
                if self
                    .inner
                    .tokens
                    .compare_exchange(
                        available,
                        available - take,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    remaining -= take;
                }
                continue;
            }

            // Sleep in short slices so limit changes are noticed promptly.
            let wait_ms = (remaining as f64 / limit as f64 * 1000.0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 100))).await;
        }
    }

    fn refill(&self, limit: u64) {
        let now = self.inner.origin.elapsed().as_nanos() as u64;
        let last = self.inner.last_refill.load(Ordering::SeqCst);
        let earned = (limit as f64 * now.saturating_sub(last) as f64 / 1e9) as u64;
        if earned == 0 {
            return;
        }
        if self
            .inner
            .last_refill
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let current = self.inner.tokens.load(Ordering::SeqCst);
            self.inner
                .tokens
                .store(current.saturating_add(earned).min(limit), Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit())
            .finish()
    }
}
