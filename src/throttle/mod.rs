pub mod gate;
pub mod origin;
pub mod rate_limiter;

// Re-export common types
pub use gate::{ConcurrencyGate, GatePermit};
pub use origin::OriginThrottle;
pub use rate_limiter::RateLimiter;
