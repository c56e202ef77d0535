pub mod patterns;
pub mod progress;

// Re-export common types
pub use patterns::{PatternStore, PatternUpdate, SitePattern};
pub use progress::{ExportFormat, ProgressState, ProgressStore, ProgressSummary, TaskStatus};
