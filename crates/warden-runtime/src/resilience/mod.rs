//! Reliability components and the pipeline that composes them.

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff, LinearBackoff};
pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitSnapshot, CircuitState};
pub use pipeline::ReliabilityPipeline;
pub use rate_limiter::{RateLimiter, TokenBucket};
pub use retry::{RetryExecutor, RetryStats};
