//! Policy engine: reliability layers applied to every access call.
//!
//! The policy stack (applied in order):
//! ```text
//! Request → [RateLimiter] → [Retry] → [Transport] → on failure: [Quarantine]
//! ```

pub mod quarantine;
pub mod rate_limiter;
pub mod retry;

pub use quarantine::QuarantineConfig;
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{retry, RetryConfig, RetryError, RetryPolicy};
