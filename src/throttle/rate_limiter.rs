use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CrawlError;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: refills continuously at `rate` tokens per second up to
/// `capacity`, and makes callers wait when the bucket is short.
///
/// The state lock is held for the whole call, sleep included, so two
/// callers can never spend the same refill.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a bucket that starts full. `capacity` defaults to `rate`
    /// (a one second burst).
    pub fn new(rate: f64, capacity: Option<f64>) -> Result<Self, CrawlError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(CrawlError::Configuration(format!(
                "rate limit must be positive, got {}",
                rate
            )));
        }
        let capacity = capacity.unwrap_or(rate);
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(CrawlError::Configuration(format!(
                "burst capacity must be positive, got {}",
                capacity
            )));
        }

        Ok(Self::from_validated(rate, capacity))
    }

    /// Build a bucket from values already checked by [`RateLimiter::new`]
    pub(crate) fn from_validated(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Take one token
    pub async fn acquire(&self) -> Duration {
        self.acquire_n(1.0).await
    }

    /// Take `n` tokens, returning how long the caller was held back
    pub async fn acquire_n(&self, n: f64) -> Duration {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens < n {
            let wait = Duration::from_secs_f64((n - state.tokens) / self.rate);
            debug!("Token bucket empty, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
            // The wait paid for exactly the missing tokens; start refilling
            // from the moment it ended
            state.tokens = 0.0;
            state.last_refill = Instant::now();
            wait
        } else {
            state.tokens -= n;
            Duration::ZERO
        }
    }

    /// Tokens currently available, after refill
    pub async fn available(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = Instant::now().duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.rate).min(self.capacity)
    }
}
