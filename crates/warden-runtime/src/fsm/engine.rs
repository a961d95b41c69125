//! The state machine engine.
//!
//! A machine is built from a validated [`FsmDefinition`] plus optional
//! hooks, guards, a state store, an event sink and observers. A transition
//! runs these steps in order:
//!
//! 1. reject targets outside the adjacency map
//! 2. evaluate the guard for the edge
//! 3. run the exit hook of the current state (best effort)
//! 4. run the entry hook of the new state (best effort)
//! 5. persist the new state; on failure surface the error
//! 6. commit the new state and append the audit record
//! 7. publish the event, then notify observers in registration order,
//!    adding their failures to that record
//!
//! Only hook calls may go through the reliability pipeline. The
//! bookkeeping steps never do.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use warden_core::{Failure, FailureKind, FsmDefinition};

use super::events::{EventSink, Observer, TransitionEvent};
use super::hooks::{Guard, StateHook};
use super::store::StateStore;
use crate::resilience::ReliabilityPipeline;

/// Where a best-effort side effect failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectStage {
    ExitHook,
    EntryHook,
    Publish,
    Observer,
}

/// A logged-and-swallowed side-effect failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideEffectFailure {
    pub stage: SideEffectStage,
    /// Hook or observer name
    pub name: String,
    pub failure: Failure,
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub sequence: u64,
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
    pub side_effect_failures: Vec<SideEffectFailure>,
}

type HookRef<C> = Arc<dyn StateHook<C>>;
type GuardRef<C> = Arc<dyn Guard<C>>;

fn config_failure(reason: impl std::fmt::Display) -> Failure {
    Failure::new(FailureKind::Config, reason.to_string())
}

/// Assembles an [`Fsm`].
pub struct FsmBuilder<C: Sync> {
    id: String,
    definition: FsmDefinition,
    entry_hooks: HashMap<String, HookRef<C>>,
    exit_hooks: HashMap<String, HookRef<C>>,
    guards: HashMap<(String, String), GuardRef<C>>,
    store: Option<Arc<dyn StateStore>>,
    sink: Option<Arc<dyn EventSink>>,
    observers: Vec<Arc<dyn Observer>>,
    pipeline: Option<Arc<ReliabilityPipeline>>,
}

impl<C: Send + Sync + 'static> FsmBuilder<C> {
    pub fn new(id: impl Into<String>, definition: FsmDefinition) -> Self {
        Self {
            id: id.into(),
            definition,
            entry_hooks: HashMap::new(),
            exit_hooks: HashMap::new(),
            guards: HashMap::new(),
            store: None,
            sink: None,
            observers: Vec::new(),
            pipeline: None,
        }
    }

    /// Hook run after entering `state`. Replaces any earlier one.
    pub fn on_enter(mut self, state: impl Into<String>, hook: impl StateHook<C> + 'static) -> Self {
        self.entry_hooks.insert(state.into(), Arc::new(hook));
        self
    }

    /// Hook run before leaving `state`. Replaces any earlier one.
    pub fn on_exit(mut self, state: impl Into<String>, hook: impl StateHook<C> + 'static) -> Self {
        self.exit_hooks.insert(state.into(), Arc::new(hook));
        self
    }

    /// Guard for the `from -> to` edge.
    pub fn guard(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: impl Guard<C> + 'static,
    ) -> Self {
        self.guards.insert((from.into(), to.into()), Arc::new(guard));
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Pipeline wrapping hooks that declare a resource.
    pub fn pipeline(mut self, pipeline: Arc<ReliabilityPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    fn check_wiring(&self) -> Result<(), Failure> {
        self.definition.validate().map_err(config_failure)?;

        for state in self.entry_hooks.keys().chain(self.exit_hooks.keys()) {
            if !self.definition.is_valid_state(state) {
                return Err(config_failure(format!(
                    "hook registered for undeclared state '{}'",
                    state
                )));
            }
        }
        for (from, to) in self.guards.keys() {
            if !self.definition.allows(from, to) {
                return Err(config_failure(format!(
                    "guard registered for undeclared transition {} -> {}",
                    from, to
                )));
            }
        }
        Ok(())
    }

    /// Build a machine in the definition's initial state.
    pub fn build(self) -> Result<Fsm<C>, Failure> {
        self.check_wiring()?;
        let initial = self.definition.initial.clone();
        Ok(self.into_fsm(initial))
    }

    /// Build a machine in the state last persisted for its id.
    ///
    /// Falls back to the initial state when nothing is stored. A stored
    /// state the definition does not declare is an error.
    pub async fn build_restored(self) -> Result<Fsm<C>, Failure> {
        self.check_wiring()?;

        let stored = match &self.store {
            Some(store) => store.get_state(&self.id).await.map_err(|e| {
                Failure::new(
                    FailureKind::Persistence,
                    format!("failed to restore '{}': {}", self.id, e),
                )
            })?,
            None => None,
        };

        let current = match stored {
            Some(state) if self.definition.is_valid_state(&state) => state,
            Some(state) => {
                return Err(Failure::new(
                    FailureKind::Persistence,
                    format!("stored state '{}' for '{}' is not declared", state, self.id),
                ))
            }
            None => self.definition.initial.clone(),
        };

        tracing::debug!(fsm_id = %self.id, state = %current, "Restored state machine");
        Ok(self.into_fsm(current))
    }

    fn into_fsm(self, current: String) -> Fsm<C> {
        Fsm {
            id: self.id,
            definition: self.definition,
            current,
            entry_hooks: self.entry_hooks,
            exit_hooks: self.exit_hooks,
            guards: self.guards,
            store: self.store,
            sink: self.sink,
            observers: self.observers,
            pipeline: self.pipeline,
            history: Vec::new(),
        }
    }
}

/// A configured state machine instance.
///
/// Transitions take `&mut self`, so the history has exactly one writer.
pub struct Fsm<C: Sync> {
    id: String,
    definition: FsmDefinition,
    current: String,
    entry_hooks: HashMap<String, HookRef<C>>,
    exit_hooks: HashMap<String, HookRef<C>>,
    guards: HashMap<(String, String), GuardRef<C>>,
    store: Option<Arc<dyn StateStore>>,
    sink: Option<Arc<dyn EventSink>>,
    observers: Vec<Arc<dyn Observer>>,
    pipeline: Option<Arc<ReliabilityPipeline>>,
    history: Vec<TransitionRecord>,
}

impl<C: Send + Sync + 'static> Fsm<C> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current_state(&self) -> &str {
        &self.current
    }

    pub fn definition(&self) -> &FsmDefinition {
        &self.definition
    }

    /// Whether the adjacency map allows moving to `to`. Guards are not run.
    pub fn can_transition(&self, to: &str) -> bool {
        self.definition.allows(&self.current, to)
    }

    /// Targets reachable from the current state.
    pub fn available_transitions(&self) -> Vec<&str> {
        self.definition.targets(&self.current)
    }

    /// Audit trail of applied transitions, oldest first.
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Move to `to`.
    ///
    /// Validation, guard and persistence failures leave the current state
    /// and history unchanged, as does cancelling the call before the store
    /// write completes. Hook, publish and observer failures are logged and
    /// recorded on the returned record.
    pub async fn transition_to(&mut self, to: &str, context: &C) -> Result<TransitionRecord, Failure> {
        let from = self.current.clone();

        if !self.definition.allows(&from, to) {
            tracing::warn!(fsm_id = %self.id, from = %from, to = %to, "Rejected invalid transition");
            return Err(Failure::invalid_transition(&from, to));
        }

        if let Some(guard) = self.guards.get(&(from.clone(), to.to_string())) {
            let refusal = match guard.check(&from, to, context) {
                Ok(true) => None,
                Ok(false) => Some(format!("guard '{}' refused", guard.name())),
                Err(reason) => Some(reason),
            };
            if let Some(reason) = refusal {
                tracing::info!(fsm_id = %self.id, from = %from, to = %to, reason = %reason, "Guard rejected transition");
                return Err(Failure::guard_rejected(&from, to, reason));
            }
        }

        let mut side_effect_failures = Vec::new();

        if let Some(hook) = self.exit_hooks.get(&from) {
            if let Err(failure) = self.run_hook(hook, &from, context).await {
                side_effect_failures.push(self.swallow(SideEffectStage::ExitHook, hook.name(), failure));
            }
        }

        // `current` is only committed once the store has accepted the new
        // state, so dropping this future at any await leaves it at `from`.
        if let Some(hook) = self.entry_hooks.get(to) {
            if let Err(failure) = self.run_hook(hook, to, context).await {
                side_effect_failures.push(self.swallow(SideEffectStage::EntryHook, hook.name(), failure));
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.set_state(&self.id, to).await {
                tracing::warn!(fsm_id = %self.id, from = %from, to = %to, error = %e, "Persisting transition failed, state unchanged");
                return Err(Failure::new(
                    FailureKind::Persistence,
                    format!("failed to persist {} -> {} for '{}': {}", from, to, self.id, e),
                ));
            }
        }

        let event = TransitionEvent {
            fsm_id: self.id.clone(),
            from: from.clone(),
            to: to.to_string(),
            sequence: self.history.len() as u64 + 1,
            at: Utc::now(),
        };

        self.current = to.to_string();
        let index = self.history.len();
        self.history.push(TransitionRecord {
            sequence: event.sequence,
            from,
            to: event.to.clone(),
            at: event.at,
            side_effect_failures,
        });

        let mut notify_failures = Vec::new();
        if let Some(sink) = &self.sink {
            if let Err(failure) = sink.publish(&event).await {
                notify_failures.push(self.swallow(SideEffectStage::Publish, "event_sink", failure));
            }
        }

        for observer in &self.observers {
            if let Err(failure) = observer.on_notify(&event).await {
                notify_failures.push(self.swallow(SideEffectStage::Observer, observer.name(), failure));
            }
        }

        tracing::debug!(fsm_id = %self.id, from = %event.from, to = %event.to, "Transition applied");

        let record = &mut self.history[index];
        record.side_effect_failures.extend(notify_failures);
        Ok(record.clone())
    }

    async fn run_hook(&self, hook: &HookRef<C>, state: &str, context: &C) -> Result<(), Failure> {
        match (hook.resource(), &self.pipeline) {
            (Some(resource), Some(pipeline)) => {
                pipeline
                    .execute(resource, || hook.call(state, context))
                    .await
            }
            _ => hook.call(state, context).await,
        }
    }

    fn swallow(&self, stage: SideEffectStage, name: &str, failure: Failure) -> SideEffectFailure {
        tracing::warn!(
            fsm_id = %self.id,
            stage = ?stage,
            name = %name,
            error = %failure,
            "Side effect failed, continuing"
        );
        SideEffectFailure {
            stage,
            name: name.to_string(),
            failure,
        }
    }
}

impl<C: Sync> std::fmt::Debug for Fsm<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}
