//! Workflow orchestration on top of the FSM engine.

mod context;
mod executor;
mod orchestrator;

pub use context::WorkflowContext;
pub use executor::{PhaseExecutor, PhaseReport};
pub use orchestrator::{Workflow, WorkflowBuilder};
