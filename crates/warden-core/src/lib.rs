//! # warden-core
//!
//! Deterministic building blocks for the warden reliability runtime.
//!
//! This crate holds everything that does not need an async runtime:
//! - the failure taxonomy every component reports through
//! - the per-resource configuration model, with schema validation
//! - declarative state machine definitions
//! - workflow phases, budgets and stagnation detection
//!
//! ## Example
//!
//! ```rust,ignore
//! use warden_core::WardenConfig;
//!
//! let config = WardenConfig::from_file("warden.yaml")?;
//! let settings = config.resolve("anthropic");
//! println!("bulkhead limit: {}", settings.bulkhead.limit);
//! ```

pub mod config;
pub mod failure;
pub mod fsm;
pub mod names;
pub mod workflow;

pub use config::{
    BackoffConfig, BulkheadConfig, CircuitBreakerConfig, ConfigError, RateLimitConfig,
    ResourceOverrides, ResourceSettings, RetryConfig, WardenConfig,
};
pub use failure::{Failure, FailureKind};
pub use fsm::{DefinitionError, FsmDefinition};
pub use workflow::{
    workflow_definition, BudgetConsumed, BudgetLimit, Phase, StagnationConfig,
    StagnationDetector, StagnationSignal, StopReason, WorkflowBudget, WorkflowConfig,
    WorkflowOutcome,
};
