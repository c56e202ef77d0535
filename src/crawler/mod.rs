pub mod backoff;
pub mod orchestrator;
pub mod origin;
pub mod task;

// Re-export common types
pub use backoff::{AdaptiveBackoffController, BackoffRegistry, BlockLevel, LearnedPacing};
pub use orchestrator::{CrawlReport, Orchestrator};
pub use origin::OriginKey;
pub use task::{FetchOutcome, Task};
