use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::crawler::origin::OriginKey;
use crate::error::CrawlError;

/// Concurrency caps: one global semaphore plus one per origin.
///
/// The caps are enforced by semaphore capacity alone; holding a
/// [`GatePermit`] is the only way to be "in flight".
#[derive(Debug)]
pub struct ConcurrencyGate {
    global: Arc<Semaphore>,
    max_global: usize,
    max_per_origin: usize,
    origins: Mutex<HashMap<OriginKey, Arc<Semaphore>>>,
}

/// Both slots held by one in-flight fetch. Dropping it releases them,
/// global first and origin second (reverse of acquisition), on every exit
/// path including cancellation.
#[derive(Debug)]
pub struct GatePermit {
    _global: OwnedSemaphorePermit,
    _origin: OwnedSemaphorePermit,
    origin: OriginKey,
}

impl GatePermit {
    pub fn origin(&self) -> &OriginKey {
        &self.origin
    }

    /// Explicit release; equivalent to dropping the permit
    pub fn release(self) {}
}

impl ConcurrencyGate {
    pub fn new(max_global: usize, max_per_origin: usize) -> Result<Self, CrawlError> {
        if max_global == 0 || max_per_origin == 0 {
            return Err(CrawlError::Configuration(
                "concurrency limits must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            global: Arc::new(Semaphore::new(max_global)),
            max_global,
            max_per_origin,
            origins: Mutex::new(HashMap::new()),
        })
    }

    async fn semaphore_for(&self, origin: &OriginKey) -> Arc<Semaphore> {
        let mut origins = self.origins.lock().await;
        origins
            .entry(origin.clone())
            .or_insert_with(|| {
                debug!(origin = %origin, cap = self.max_per_origin, "New origin gate");
                Arc::new(Semaphore::new(self.max_per_origin))
            })
            .clone()
    }

    /// Take an origin slot, then a global slot
    pub async fn acquire(&self, url: &str) -> Result<GatePermit, CrawlError> {
        let origin = OriginKey::parse(url)?;
        let origin_semaphore = self.semaphore_for(&origin).await;

        let origin_permit = origin_semaphore
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::ShutdownAborted)?;
        let global_permit = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::ShutdownAborted)?;

        Ok(GatePermit {
            _global: global_permit,
            _origin: origin_permit,
            origin,
        })
    }

    /// Fetches currently holding a global slot
    pub fn in_flight(&self) -> usize {
        self.max_global - self.global.available_permits()
    }

    pub async fn in_flight_for(&self, url: &str) -> usize {
        let Ok(origin) = OriginKey::parse(url) else {
            return 0;
        };
        let origins = self.origins.lock().await;
        origins
            .get(&origin)
            .map(|s| self.max_per_origin - s.available_permits())
            .unwrap_or(0)
    }
}
