use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP statuses that an origin uses to say "stop automating me".
pub const BLOCK_STATUS_CODES: [u16; 2] = [403, 429];

/// Classified failure of a single fetch attempt or of startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrawlError {
    /// Network problem, timeout or a non-blocking error status
    #[error("transport failure: {0}")]
    Transport(String),

    /// The origin answered with an explicit block status
    #[error("blocked by origin (HTTP {status}): {message}")]
    Blocked { status: u16, message: String },

    /// Bad flags, bad URL or an unusable environment
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cooperative cancellation reached this URL before it finished
    #[error("shutdown requested")]
    ShutdownAborted,
}

/// Serializable discriminant of [`CrawlError`], stored in outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransportFailure,
    BlockedFailure,
    ConfigurationError,
    ShutdownAborted,
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Transport(_) => ErrorKind::TransportFailure,
            CrawlError::Blocked { .. } => ErrorKind::BlockedFailure,
            CrawlError::Configuration(_) => ErrorKind::ConfigurationError,
            CrawlError::ShutdownAborted => ErrorKind::ShutdownAborted,
        }
    }

    /// Only transport and block failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrawlError::Transport(_) | CrawlError::Blocked { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            CrawlError::Blocked { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify an unsuccessful collaborator reply.
    pub fn from_response(status_code: Option<u16>, error: Option<&str>) -> Self {
        let message = error.unwrap_or("unknown error").to_string();
        match status_code {
            Some(status) if BLOCK_STATUS_CODES.contains(&status) => {
                CrawlError::Blocked { status, message }
            }
            Some(status) => CrawlError::Transport(format!("HTTP {}: {}", status, message)),
            None => CrawlError::Transport(message),
        }
    }
}
