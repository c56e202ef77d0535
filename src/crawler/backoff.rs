//! Adaptive pacing.
//!
//! [`AdaptiveBackoffController`] tracks how hard an origin is pushing back
//! and widens the delay window exponentially with the block level. It is a
//! plain synchronous state machine; the orchestrator keeps one per origin in
//! a [`BackoffRegistry`].

use std::collections::HashMap;
use std::time::Duration;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crawler::origin::OriginKey;
use crate::error::BLOCK_STATUS_CODES;

/// Successes in a row needed to step the block level down once.
pub const RECOVERY_STREAK: u32 = 5;

/// How aggressively an origin appears to be rejecting us
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockLevel {
    None = 0,
    Light = 1,
    Moderate = 2,
    Severe = 3,
}

impl BlockLevel {
    pub fn value(self) -> u32 {
        self as u32
    }

    fn from_value(value: u32) -> Self {
        match value {
            0 => BlockLevel::None,
            1 => BlockLevel::Light,
            2 => BlockLevel::Moderate,
            _ => BlockLevel::Severe,
        }
    }

    fn step_down(self) -> Self {
        Self::from_value(self.value().saturating_sub(1))
    }

    fn step_up(self, steps: u32) -> Self {
        Self::from_value((self.value() + steps).min(BlockLevel::Severe.value()))
    }
}

/// Pacing that previously worked for an origin/shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LearnedPacing {
    pub min_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub blocked_at_request: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveBackoffController {
    min_delay: f64,
    max_delay: f64,
    block_level: BlockLevel,
    consecutive_successes: u32,
    consecutive_failures: u32,
    request_count: u64,
    blocked_at: Option<u64>,
    known_block_threshold: Option<u64>,
}

impl AdaptiveBackoffController {
    pub fn new(min_delay: f64, max_delay: f64) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            block_level: BlockLevel::None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            request_count: 0,
            blocked_at: None,
            known_block_threshold: None,
        }
    }

    /// Start from the last known-safe pacing instead of the defaults
    pub fn seeded(min_delay: f64, max_delay: f64, learned: &LearnedPacing) -> Self {
        let min = learned.min_delay.unwrap_or(min_delay);
        let max = learned.max_delay.unwrap_or(max_delay);
        let mut controller = Self::new(min, max);
        controller.known_block_threshold = learned.blocked_at_request;
        controller
    }

    pub fn block_level(&self) -> BlockLevel {
        self.block_level
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn blocked_at(&self) -> Option<u64> {
        self.blocked_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Request index at which an earlier session got blocked, if known
    pub fn known_block_threshold(&self) -> Option<u64> {
        self.known_block_threshold
    }

    /// The current delay window, widened by `2^level`
    pub fn delay_window(&self) -> (f64, f64) {
        let multiplier = f64::from(1u32 << self.block_level.value());
        (self.min_delay * multiplier, self.max_delay * multiplier)
    }

    /// Uniform draw from the current delay window
    pub fn delay(&self) -> Duration {
        let (low, high) = self.delay_window();
        let secs = if high > low {
            thread_rng().gen_range(low..=high)
        } else {
            low
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn record_request(&mut self) {
        self.request_count += 1;
    }

    pub fn report_success(&mut self) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;

        if self.consecutive_successes >= RECOVERY_STREAK && self.block_level > BlockLevel::None {
            self.block_level = self.block_level.step_down();
            self.consecutive_successes = 0;
        }
    }

    pub fn report_failure(&mut self, status_code: Option<u16>) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;

        if self.blocked_at.is_none() {
            self.blocked_at = Some(self.request_count);
        }

        let escalation = match status_code {
            Some(status) if BLOCK_STATUS_CODES.contains(&status) => 2,
            _ => 1,
        };
        self.block_level = self.block_level.step_up(escalation);
    }

    /// Pacing worth remembering for the next session
    pub fn learned(&self) -> LearnedPacing {
        LearnedPacing {
            min_delay: Some(self.min_delay),
            max_delay: Some(self.max_delay),
            blocked_at_request: self.blocked_at.or(self.known_block_threshold),
        }
    }
}

/// Base retry delay `base * 2^retry`, capped at `max`, before jitter.
pub fn retry_delay(retry_count: u32, base: f64, max: f64) -> Duration {
    let factor = 2f64.powi(retry_count.min(30) as i32);
    Duration::from_secs_f64((base * factor).min(max).max(0.0))
}

/// [`retry_delay`] plus up to 10% random jitter
pub fn retry_delay_with_jitter(retry_count: u32, base: f64, max: f64) -> Duration {
    let delay = retry_delay(retry_count, base, max);
    let jitter = thread_rng().gen_range(0.0..=0.1) * delay.as_secs_f64();
    delay + Duration::from_secs_f64(jitter)
}

/// One backoff controller per origin for the life of a run
#[derive(Debug)]
pub struct BackoffRegistry {
    min_delay: f64,
    max_delay: f64,
    controllers: Mutex<HashMap<OriginKey, AdaptiveBackoffController>>,
}

impl BackoffRegistry {
    pub fn new(min_delay: f64, max_delay: f64) -> Self {
        Self {
            min_delay,
            max_delay,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    /// Create the origin's controller if it does not exist yet.
    ///
    /// `seed` is only consulted on creation.
    pub async fn ensure(&self, origin: &OriginKey, seed: Option<&LearnedPacing>) {
        let mut controllers = self.controllers.lock().await;
        controllers.entry(origin.clone()).or_insert_with(|| match seed {
            Some(learned) => {
                info!(origin = %origin, "Seeding pacing from learned pattern");
                AdaptiveBackoffController::seeded(self.min_delay, self.max_delay, learned)
            }
            None => AdaptiveBackoffController::new(self.min_delay, self.max_delay),
        });
    }

    pub async fn contains(&self, origin: &OriginKey) -> bool {
        self.controllers.lock().await.contains_key(origin)
    }

    /// Count the attempt and return the extra pause to take, if the origin
    /// is currently escalated
    pub async fn begin_attempt(&self, origin: &OriginKey) -> Option<Duration> {
        let mut controllers = self.controllers.lock().await;
        let controller = controllers
            .entry(origin.clone())
            .or_insert_with(|| AdaptiveBackoffController::new(self.min_delay, self.max_delay));
        controller.record_request();

        if controller.block_level() > BlockLevel::None {
            let pause = controller.delay();
            debug!(origin = %origin, level = ?controller.block_level(), "Escalated pacing: {:?}", pause);
            Some(pause)
        } else {
            None
        }
    }

    pub async fn report_success(&self, origin: &OriginKey) -> LearnedPacing {
        let mut controllers = self.controllers.lock().await;
        let controller = controllers
            .entry(origin.clone())
            .or_insert_with(|| AdaptiveBackoffController::new(self.min_delay, self.max_delay));
        let before = controller.block_level();
        controller.report_success();
        if controller.block_level() < before {
            info!(origin = %origin, level = ?controller.block_level(), "Block level relaxed");
        }
        controller.learned()
    }

    pub async fn report_failure(&self, origin: &OriginKey, status_code: Option<u16>) -> BlockLevel {
        let mut controllers = self.controllers.lock().await;
        let controller = controllers
            .entry(origin.clone())
            .or_insert_with(|| AdaptiveBackoffController::new(self.min_delay, self.max_delay));
        controller.report_failure(status_code);
        let level = controller.block_level();
        if level > BlockLevel::None {
            warn!(origin = %origin, status = ?status_code, level = ?level, "Origin pushing back, escalating");
        }
        level
    }

    pub async fn level(&self, origin: &OriginKey) -> BlockLevel {
        self.controllers
            .lock()
            .await
            .get(origin)
            .map(|c| c.block_level())
            .unwrap_or(BlockLevel::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_status_reaches_severe_in_two_steps() {
        let mut controller = AdaptiveBackoffController::new(1.0, 3.0);
        controller.report_failure(Some(429));
        assert_eq!(controller.block_level(), BlockLevel::Moderate);
        controller.report_failure(Some(429));
        assert_eq!(controller.block_level(), BlockLevel::Severe);

        for _ in 0..10 {
            controller.report_failure(Some(429));
            assert_eq!(controller.block_level(), BlockLevel::Severe);
        }
    }

    #[test]
    fn test_plain_failure_escalates_one_step() {
        let mut controller = AdaptiveBackoffController::new(1.0, 3.0);
        controller.report_failure(None);
        assert_eq!(controller.block_level(), BlockLevel::Light);
        controller.report_failure(Some(500));
        assert_eq!(controller.block_level(), BlockLevel::Moderate);
        assert_eq!(controller.consecutive_failures(), 2);
    }

    #[test]
    fn test_recovery_is_gradual() {
        let mut controller = AdaptiveBackoffController::new(1.0, 3.0);
        controller.report_failure(Some(403));
        controller.report_failure(Some(403));
        assert_eq!(controller.block_level(), BlockLevel::Severe);

        for _ in 0..4 {
            controller.report_success();
        }
        assert_eq!(controller.block_level(), BlockLevel::Severe);
        controller.report_success();
        assert_eq!(controller.block_level(), BlockLevel::Moderate);

        for _ in 0..5 {
            controller.report_success();
        }
        assert_eq!(controller.block_level(), BlockLevel::Light);

        // A failure interrupts the streak
        for _ in 0..4 {
            controller.report_success();
        }
        controller.report_failure(None);
        assert_eq!(controller.block_level(), BlockLevel::Moderate);
    }

    #[test]
    fn test_blocked_at_records_first_failure_only() {
        let mut controller = AdaptiveBackoffController::new(1.0, 3.0);
        for _ in 0..7 {
            controller.record_request();
        }
        controller.report_failure(None);
        controller.record_request();
        controller.report_failure(None);
        assert_eq!(controller.blocked_at(), Some(7));
        assert_eq!(controller.learned().blocked_at_request, Some(7));
    }

    #[test]
    fn test_delay_window_doubles_per_level() {
        let mut controller = AdaptiveBackoffController::new(1.0, 3.0);
        assert_eq!(controller.delay_window(), (1.0, 3.0));
        controller.report_failure(None);
        assert_eq!(controller.delay_window(), (2.0, 6.0));
        controller.report_failure(Some(429));
        assert_eq!(controller.delay_window(), (8.0, 24.0));

        for _ in 0..50 {
            let delay = controller.delay().as_secs_f64();
            assert!((8.0..=24.0).contains(&delay));
        }
    }

    #[test]
    fn test_seeded_from_learned_pacing() {
        let learned = LearnedPacing {
            min_delay: Some(4.0),
            max_delay: Some(9.0),
            blocked_at_request: Some(30),
        };
        let controller = AdaptiveBackoffController::seeded(1.0, 3.0, &learned);
        assert_eq!(controller.delay_window(), (4.0, 9.0));
        assert_eq!(controller.known_block_threshold(), Some(30));
        assert_eq!(controller.blocked_at(), None);
        assert_eq!(controller.learned().blocked_at_request, Some(30), "kept until a new block");

        let partial = LearnedPacing { min_delay: Some(2.0), ..Default::default() };
        let controller = AdaptiveBackoffController::seeded(1.0, 3.0, &partial);
        assert_eq!(controller.delay_window(), (2.0, 3.0));
    }

    #[test]
    fn test_retry_delay_caps() {
        let delays: Vec<f64> = (0..5).map(|k| retry_delay(k, 5.0, 60.0).as_secs_f64()).collect();
        assert_eq!(delays, vec![5.0, 10.0, 20.0, 40.0, 60.0]);
        assert_eq!(retry_delay(40, 5.0, 60.0).as_secs_f64(), 60.0);

        for k in 0..5 {
            let base = retry_delay(k, 5.0, 60.0).as_secs_f64();
            let jittered = retry_delay_with_jitter(k, 5.0, 60.0).as_secs_f64();
            assert!(jittered >= base && jittered <= base * 1.1 + 1e-6);
        }
    }

    #[tokio::test]
    async fn test_registry_pauses_only_when_escalated() {
        let registry = BackoffRegistry::new(0.5, 1.0);
        let origin = OriginKey::parse("https://example.com/").unwrap();

        assert!(registry.begin_attempt(&origin).await.is_none());
        assert_eq!(registry.report_failure(&origin, Some(429)).await, BlockLevel::Moderate);

        let pause = registry.begin_attempt(&origin).await.expect("escalated");
        assert!(pause >= Duration::from_secs(2) && pause <= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_registry_seed_applies_once() {
        let registry = BackoffRegistry::new(1.0, 2.0);
        let origin = OriginKey::parse("https://example.com/").unwrap();
        let learned = LearnedPacing { min_delay: Some(5.0), max_delay: Some(6.0), blocked_at_request: None };

        registry.ensure(&origin, Some(&learned)).await;
        registry.ensure(&origin, None).await;
        assert!(registry.contains(&origin).await);

        let pacing = registry.report_success(&origin).await;
        assert_eq!(pacing.min_delay, Some(5.0));
        assert_eq!(pacing.max_delay, Some(6.0));
    }
}
