use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::sync::Mutex;
use tracing::debug;

use crate::crawler::origin::OriginKey;
use crate::error::CrawlError;
use crate::throttle::rate_limiter::RateLimiter;

/// Global plus per-origin token buckets, followed by a random jitter.
#[derive(Debug)]
pub struct OriginThrottle {
    global: RateLimiter,
    per_origin_rate: f64,
    min_delay: f64,
    max_delay: f64,
    origins: Mutex<HashMap<OriginKey, Arc<RateLimiter>>>,
}

impl OriginThrottle {
    pub fn new(
        global_rate: f64,
        per_origin_rate: f64,
        min_delay: f64,
        max_delay: f64,
    ) -> Result<Self, CrawlError> {
        // Validate the per-origin rate now rather than on first use
        RateLimiter::new(per_origin_rate, None)?;
        if min_delay < 0.0 || max_delay < min_delay {
            return Err(CrawlError::Configuration(format!(
                "invalid jitter range [{}, {}]",
                min_delay, max_delay
            )));
        }

        Ok(Self {
            global: RateLimiter::new(global_rate, None)?,
            per_origin_rate,
            min_delay,
            max_delay,
            origins: Mutex::new(HashMap::new()),
        })
    }

    /// Get or lazily create the origin's bucket. Creation happens inside
    /// the registry lock, so concurrent first access yields one instance.
    pub async fn limiter_for(&self, origin: &OriginKey) -> Arc<RateLimiter> {
        let mut origins = self.origins.lock().await;
        origins
            .entry(origin.clone())
            .or_insert_with(|| {
                debug!(origin = %origin, rate = self.per_origin_rate, "New origin throttle");
                Arc::new(RateLimiter::from_validated(
                    self.per_origin_rate,
                    self.per_origin_rate,
                ))
            })
            .clone()
    }

    pub async fn origin_count(&self) -> usize {
        self.origins.lock().await.len()
    }

    /// Wait for the global bucket, then the origin bucket, then jitter.
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, url: &str) -> Result<Duration, CrawlError> {
        let origin = OriginKey::parse(url)?;
        let origin_limiter = self.limiter_for(&origin).await;

        let global_wait = self.global.acquire().await;
        let origin_wait = origin_limiter.acquire().await;

        let jitter = self.jitter();
        if jitter > Duration::ZERO {
            tokio::time::sleep(jitter).await;
        }

        let total = global_wait + origin_wait + jitter;
        debug!(origin = %origin, "Throttled for {:?}", total);
        Ok(total)
    }

    fn jitter(&self) -> Duration {
        let secs = if self.max_delay > self.min_delay {
            thread_rng().gen_range(self.min_delay..=self.max_delay)
        } else {
            self.min_delay
        };
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_rejects_bad_ranges() {
        assert!(OriginThrottle::new(10.0, 0.0, 0.0, 0.0).is_err());
        assert!(OriginThrottle::new(10.0, 1.0, 2.0, 1.0).is_err());
        assert!(OriginThrottle::new(10.0, 1.0, -1.0, 1.0).is_err());
    }

    #[tokio::test]
    async fn test_same_host_shares_one_limiter() {
        let throttle = Arc::new(OriginThrottle::new(100.0, 100.0, 0.0, 0.0).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let throttle = throttle.clone();
                tokio::spawn(async move {
                    let origin = OriginKey::parse(&format!("https://example.com/page/{}", i)).unwrap();
                    throttle.limiter_for(&origin).await
                })
            })
            .collect();

        let mut limiters = Vec::new();
        for handle in handles {
            limiters.push(handle.await.unwrap());
        }

        assert_eq!(throttle.origin_count().await, 1);
        assert!(limiters.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_origin_rate_applies() {
        let throttle = OriginThrottle::new(100.0, 2.0, 0.0, 0.0).unwrap();
        let start = Instant::now();

        for i in 0..4 {
            throttle.acquire(&format!("https://slow.example/{}", i)).await.unwrap();
        }
        // Burst of two, then two more at two per second
        assert!(start.elapsed() >= Duration::from_millis(999));

        // A different origin is not held back by the first one
        let other = Instant::now();
        throttle.acquire("https://fast.example/").await.unwrap();
        assert!(other.elapsed() < Duration::from_millis(1));
        assert_eq!(throttle.origin_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_added_to_wait() {
        let throttle = OriginThrottle::new(100.0, 100.0, 0.5, 1.5).unwrap();
        let waited = throttle.acquire("https://example.com/").await.unwrap();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited <= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let throttle = OriginThrottle::new(10.0, 1.0, 0.0, 0.0).unwrap();
        assert!(matches!(
            throttle.acquire("nope").await,
            Err(CrawlError::Configuration(_))
        ));
    }
}
