use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::crawler::task::FetchOutcome;

/// Running counters for one orchestrator run
#[derive(Debug, Clone)]
pub struct RunMetrics {
    inner: Arc<Mutex<Counters>>,
}

#[derive(Debug)]
struct Counters {
    started_at: DateTime<Utc>,
    started: Instant,
    stats: RunStats,
}

/// Counts of what happened to each URL
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// URLs handed to the run
    pub total: usize,

    /// URLs fetched successfully in this run
    pub completed: usize,

    /// URLs that exhausted their retries or could not be attempted
    pub failed: usize,

    /// Retry attempts scheduled
    pub retried: usize,

    /// URLs skipped because an earlier run completed them
    pub skipped: usize,

    /// URLs left incomplete by shutdown
    pub aborted: usize,

    /// Fetch attempts per status code
    pub status_codes: BTreeMap<u16, usize>,
}

/// Snapshot with timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: RunStats,
    pub duration_secs: f64,
    pub urls_per_second: f64,
}

impl RunMetrics {
    pub fn new(total: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Counters {
                started_at: Utc::now(),
                started: Instant::now(),
                stats: RunStats {
                    total,
                    ..Default::default()
                },
            })),
        }
    }

    pub async fn record_attempt(&self, status_code: Option<u16>) {
        if let Some(code) = status_code {
            let mut inner = self.inner.lock().await;
            *inner.stats.status_codes.entry(code).or_default() += 1;
        }
    }

    pub async fn record_retry(&self) {
        self.inner.lock().await.stats.retried += 1;
    }

    /// Count a URL's final outcome
    pub async fn record_outcome(&self, outcome: &FetchOutcome) {
        let mut inner = self.inner.lock().await;
        let stats = &mut inner.stats;
        if outcome.skipped {
            stats.skipped += 1;
        } else if outcome.success {
            stats.completed += 1;
        } else if outcome.is_aborted() {
            stats.aborted += 1;
        } else {
            stats.failed += 1;
        }
    }

    pub async fn stats(&self) -> RunStats {
        self.inner.lock().await.stats.clone()
    }

    pub async fn summary(&self) -> RunSummary {
        let inner = self.inner.lock().await;
        let elapsed = inner.started.elapsed();
        let processed = inner.stats.completed + inner.stats.failed;
        RunSummary {
            started_at: inner.started_at,
            stats: inner.stats.clone(),
            duration_secs: elapsed.as_secs_f64(),
            urls_per_second: rate(processed, elapsed),
        }
    }
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
