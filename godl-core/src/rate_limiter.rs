//! Token-bucket rate limiter for download throughput (spec §4.1).
//!
//! One [`RateLimiter`] is shared by all workers of a single download. Unlike
//! the per-domain delay limiter this engine's ancestor used, this is a
//! straightforward bytes/second token bucket: callers `acquire(n)` bytes of
//! budget before writing a slice, and the limiter refills at `refill_rate`.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use godl_core::rate_limiter::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(1_000_000));
//! limiter.acquire(65536).await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Default burst capacity when `max_rate` would otherwise allow a smaller
/// bucket (1 MiB, per spec §4.1).
const DEFAULT_BURST: u64 = 1024 * 1024;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter shared across a download's worker pool.
///
/// `capacity = max(refill_rate, default_burst)`. When `refill_rate == 0`,
/// [`RateLimiter::acquire`] is a no-op (spec §4.1 "unlimited").
#[derive(Debug)]
pub struct RateLimiter {
    refill_rate: u64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter refilling at `bytes_per_sec`. `0` means unlimited.
    #[must_use]
    #[instrument(fields(bytes_per_sec))]
    pub fn new(bytes_per_sec: u64) -> Self {
        let capacity = (bytes_per_sec.max(DEFAULT_BURST)) as f64;
        debug!(bytes_per_sec, capacity, "creating rate limiter");
        Self {
            refill_rate: bytes_per_sec,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates an unlimited rate limiter (`max_rate == 0`).
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.refill_rate == 0
    }

    #[must_use]
    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Blocks until `n` bytes of budget are available, splitting the request
    /// into `<= capacity`-sized waits when `n` exceeds bucket capacity
    /// (spec §4.1). Returns early with `Err(())` if `cancel` fires first.
    #[instrument(skip(self, cancel), fields(n))]
    pub async fn acquire(&self, n: u64) -> Result<(), Cancelled> {
        self.acquire_cancellable(n, &CancellationToken::new()).await
    }

    /// Same as [`Self::acquire`] but honors an externally owned cancellation
    /// token, returning promptly once it is triggered (spec §5 cancellation
    /// is "observable within one I/O read cycle").
    pub async fn acquire_cancellable(
        &self,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        if self.refill_rate == 0 || n == 0 {
            return Ok(());
        }

        let mut remaining = n;
        let slice_cap = self.capacity as u64;

        while remaining > 0 {
            let take = remaining.min(slice_cap);
            tokio::select! {
                () = cancel.cancelled() => return Err(Cancelled),
                result = self.acquire_slice(take) => result?,
            }
            remaining -= take;
        }
        Ok(())
    }

    async fn acquire_slice(&self, n: u64) -> Result<(), Cancelled> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= n as f64 {
                    bucket.tokens -= n as f64;
                    None
                } else {
                    let deficit = n as f64 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_rate as f64))
                }
            };
            match wait {
                None => return Ok(()),
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate as f64).min(self.capacity);
        bucket.last_refill = now;
    }
}

/// Shareable alias used by workers spawned across tasks.
pub type SharedRateLimiter = Arc<RateLimiter>;

/// Marker error returned when `acquire` is interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;
