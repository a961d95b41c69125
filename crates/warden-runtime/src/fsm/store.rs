//! Persistence collaborator for machine state.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors from a state store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Write failed: {0}")]
    Write(String),

    #[error("Read failed: {0}")]
    Read(String),
}

/// Key-value store holding the current state of each machine.
///
/// Implemented outside this crate; the engine only reads on restore and
/// writes after each transition.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set_state(&self, fsm_id: &str, state: &str) -> Result<(), StoreError>;

    async fn get_state(&self, fsm_id: &str) -> Result<Option<String>, StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, String>>,
    reject_writes: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, simulating an unavailable backend.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Snapshot of every stored state.
    pub fn entries(&self) -> HashMap<String, String> {
        self.states.read().clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn set_state(&self, fsm_id: &str, state: &str) -> Result<(), StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write(format!("store unavailable for '{}'", fsm_id)));
        }
        self.states
            .write()
            .insert(fsm_id.to_string(), state.to_string());
        Ok(())
    }

    async fn get_state(&self, fsm_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.states.read().get(fsm_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_rejection() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.get_state("m").await.unwrap(), None);

        store.set_state("m", "open").await.unwrap();
        assert_eq!(store.get_state("m").await.unwrap().as_deref(), Some("open"));

        store.set_reject_writes(true);
        assert!(matches!(
            store.set_state("m", "closed").await,
            Err(StoreError::Write(_))
        ));
        assert_eq!(store.entries().get("m").map(String::as_str), Some("open"));
    }
}
