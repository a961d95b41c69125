//! Configurable state machine engine.

mod engine;
mod events;
mod hooks;
mod store;

pub use engine::{Fsm, FsmBuilder, SideEffectFailure, SideEffectStage, TransitionRecord};
pub use events::{ChannelSink, EventSink, Observer, TransitionEvent};
pub use hooks::{guard_fn, hook_fn, FnGuard, FnHook, Guard, StateHook};
pub use store::{InMemoryStateStore, StateStore, StoreError};
