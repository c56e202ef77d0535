//! Concurrent, rate-limited, resumable URL fetching.
//!
//! The [`crawler::Orchestrator`] runs a bounded worker pool over a URL list.
//! Each fetch passes a global and per-origin token bucket
//! ([`throttle::OriginThrottle`]), a per-origin adaptive backoff pause, and
//! a global plus per-origin concurrency gate ([`throttle::ConcurrencyGate`])
//! before reaching a [`fetch::Fetcher`]. Progress is kept per task in
//! [`storage::ProgressStore`] so an interrupted run can pick up where it
//! stopped, and [`storage::PatternStore`] remembers which pacing worked for
//! each site.

pub mod cli;
pub mod crawler;
pub mod error;
pub mod fetch;
pub mod storage;
pub mod throttle;
pub mod utils;

pub use error::{CrawlError, ErrorKind};
