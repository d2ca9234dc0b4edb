use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default sustained request rate against the upstream API.
pub const DEFAULT_RATE_PER_SECOND: u32 = 10;

/// Default burst capacity.
pub const DEFAULT_BURST: u32 = 5;

/// Token-bucket limiter shared by every fetch worker.
///
/// Refills at `rate_per_second` tokens per second up to `burst` tokens. Cloning
/// shares the bucket, so the bound holds no matter how many workers hold a
/// clone.
///
/// # Example
///
/// ```ignore
/// use lotsync::upstream::ApiRateLimiter;
///
/// let limiter = ApiRateLimiter::new(10, 5);
/// limiter.acquire().await;
/// source.fetch_page(page, 100).await?;
/// ```
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
    burst: NonZeroU32,
}

impl ApiRateLimiter {
    /// Create a limiter; zero values are raised to 1.
    pub fn new(rate_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(rate_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_second(rate).allow_burst(burst));

        Self {
            inner: Arc::new(limiter),
            burst,
        }
    }

    /// Burst capacity of the bucket.
    pub fn burst(&self) -> u32 {
        self.burst.get()
    }

    /// Wait for one token.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Wait for `n` tokens.
    ///
    /// Requests larger than the burst capacity are clamped to it, so this
    /// never fails, it only waits.
    pub async fn acquire_n(&self, n: u32) {
        let n = NonZeroU32::new(n.min(self.burst.get())).unwrap_or(NonZeroU32::MIN);
        if self.inner.until_n_ready(n).await.is_err() {
            // Unreachable after clamping; fall back to a single token.
            self.inner.until_ready().await;
        }
    }
}

impl Default for ApiRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_PER_SECOND, DEFAULT_BURST)
    }
}

impl std::fmt::Debug for ApiRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRateLimiter")
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}
