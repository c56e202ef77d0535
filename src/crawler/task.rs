use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CrawlError, ErrorKind};

/// A URL waiting to be fetched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    /// URL to fetch; this is the identity of the task
    pub url: String,

    /// Number of attempts already spent on this URL
    pub retry_count: u32,
}

impl Task {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry_count: 0,
        }
    }

    /// The same task, one attempt later
    pub fn next_attempt(&self) -> Self {
        Self {
            url: self.url.clone(),
            retry_count: self.retry_count + 1,
        }
    }
}

/// Result of processing one URL, including all of its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// URL that was processed
    pub url: String,

    /// Whether the URL ended up fetched
    pub success: bool,

    /// Whether the URL was already completed by an earlier run
    #[serde(default)]
    pub skipped: bool,

    /// Classification of the final failure
    pub error_kind: Option<ErrorKind>,

    /// Human readable error message
    pub error: Option<String>,

    /// Status reported by the collaborator, if any
    pub status_code: Option<u16>,

    /// Page title (if available)
    #[serde(default)]
    pub title: String,

    /// Text rendition of the page
    #[serde(default)]
    pub content: String,

    /// Wall time spent on the final attempt
    pub duration_ms: u64,

    /// Retries spent before this outcome
    pub retry_count: u32,

    /// When the outcome was produced
    pub timestamp: DateTime<Utc>,
}

impl FetchOutcome {
    pub fn succeeded(task: &Task, status_code: Option<u16>, title: String, content: String, duration_ms: u64) -> Self {
        Self {
            url: task.url.clone(),
            success: true,
            skipped: false,
            error_kind: None,
            error: None,
            status_code,
            title,
            content,
            duration_ms,
            retry_count: task.retry_count,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(task: &Task, error: &CrawlError, duration_ms: u64) -> Self {
        Self {
            url: task.url.clone(),
            success: false,
            skipped: false,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            status_code: error.status_code(),
            title: String::new(),
            content: String::new(),
            duration_ms,
            retry_count: task.retry_count,
            timestamp: Utc::now(),
        }
    }

    /// Resume fast-path: the URL is already in the completed set
    pub fn already_completed(url: &str) -> Self {
        Self {
            url: url.to_string(),
            success: true,
            skipped: true,
            error_kind: None,
            error: None,
            status_code: None,
            title: String::new(),
            content: String::new(),
            duration_ms: 0,
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.error_kind == Some(ErrorKind::ShutdownAborted)
    }
}
