//! # warden-runtime
//!
//! Async reliability runtime for warden.
//!
//! Three layers, leaves first:
//! - [`resilience`]: per-resource rate limiting, circuit breaking, bulkhead
//!   isolation and retries, composed by [`ReliabilityPipeline`]
//! - [`fsm`]: a declaratively configured state machine with guards, hooks,
//!   persistence and observers
//! - [`workflow`]: the six-phase agent loop with hard budgets and
//!   stagnation-driven strategy switches
//!
//! ## Example
//!
//! ```rust,ignore
//! use warden_core::{Failure, WardenConfig};
//! use warden_runtime::ReliabilityPipeline;
//!
//! let config = WardenConfig::from_file("warden.yaml")?;
//! let pipeline = ReliabilityPipeline::from_config(&config);
//!
//! let reply = pipeline
//!     .execute("anthropic", || async { call_provider().await })
//!     .await?;
//! ```

pub mod fsm;
pub mod resilience;
pub mod workflow;

pub use fsm::{
    guard_fn, hook_fn, ChannelSink, EventSink, Fsm, FsmBuilder, Guard, InMemoryStateStore,
    Observer, StateHook, StateStore, StoreError, TransitionEvent, TransitionRecord,
};
pub use resilience::{
    Backoff, Bulkhead, BulkheadPermit, CircuitBreaker, CircuitPermit, CircuitState,
    ExponentialBackoff, FixedBackoff, LinearBackoff, RateLimiter, ReliabilityPipeline,
    RetryExecutor, RetryStats,
};
pub use workflow::{PhaseExecutor, PhaseReport, Workflow, WorkflowBuilder, WorkflowContext};
