//! Declarative state machine definitions.
//!
//! A definition names the valid states, the initial state and the
//! transition adjacency map. The runtime engine is built from one; nothing
//! about the states is hard-coded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::names::is_valid_state_name;

/// Errors from definition validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("No states declared")]
    Empty,

    #[error("Initial state '{0}' is not a declared state")]
    UnknownInitial(String),

    #[error("Transition source '{0}' is not a declared state")]
    UnknownSource(String),

    #[error("Transition {from} -> {to} targets an undeclared state")]
    UnknownTarget { from: String, to: String },

    #[error("Invalid state name '{0}'")]
    InvalidName(String),

    #[error("Failed to parse definition: {0}")]
    Parse(String),
}

/// A declarative FSM definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsmDefinition {
    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Starting state
    pub initial: String,

    /// All valid states
    pub states: BTreeSet<String>,

    /// Adjacency map: state -> states reachable in one step
    #[serde(default)]
    pub transitions: BTreeMap<String, BTreeSet<String>>,
}

impl FsmDefinition {
    /// Start a definition with the given initial state.
    pub fn new(name: impl Into<String>, initial: impl Into<String>) -> Self {
        let initial = initial.into();
        Self {
            name: name.into(),
            states: BTreeSet::from([initial.clone()]),
            initial,
            transitions: BTreeMap::new(),
        }
    }

    /// Declare a state.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.states.insert(state.into());
        self
    }

    /// Declare an allowed transition. Both ends are declared as states.
    pub fn transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        self.states.insert(from.clone());
        self.states.insert(to.clone());
        self.transitions.entry(from).or_default().insert(to);
        self
    }

    /// Parse and validate a definition from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        let definition: FsmDefinition =
            serde_yaml::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse and validate a definition from JSON.
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        let definition: FsmDefinition =
            serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.states.is_empty() {
            return Err(DefinitionError::Empty);
        }

        if let Some(bad) = self.states.iter().find(|s| !is_valid_state_name(s)) {
            return Err(DefinitionError::InvalidName(bad.clone()));
        }

        if !self.states.contains(&self.initial) {
            return Err(DefinitionError::UnknownInitial(self.initial.clone()));
        }

        for (from, targets) in &self.transitions {
            if !self.states.contains(from) {
                return Err(DefinitionError::UnknownSource(from.clone()));
            }
            for to in targets {
                if !self.states.contains(to) {
                    return Err(DefinitionError::UnknownTarget {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Whether `state` is declared.
    pub fn is_valid_state(&self, state: &str) -> bool {
        self.states.contains(state)
    }

    /// Whether `from -> to` is in the adjacency map.
    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.transitions
            .get(from)
            .map(|targets| targets.contains(to))
            .unwrap_or(false)
    }

    /// States reachable from `from` in one step.
    pub fn targets(&self, from: &str) -> Vec<&str> {
        self.transitions
            .get(from)
            .map(|targets| targets.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// States with no outgoing transitions.
    pub fn terminal_states(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter(|s| self.transitions.get(*s).map_or(true, |t| t.is_empty()))
            .map(|s| s.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOOR: &str = r#"
name: door
initial: closed
states: [closed, open, locked]
transitions:
  closed: [open, locked]
  open: [closed]
  locked: [closed]
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let def = FsmDefinition::from_yaml(DOOR).unwrap();
        assert_eq!(def.initial, "closed");
        assert!(def.allows("closed", "locked"));
        assert!(!def.allows("open", "locked"));
        assert_eq!(def.targets("closed"), vec!["locked", "open"]);
    }

    #[test]
    fn test_unknown_target_rejected() {
        let yaml = "initial: a\nstates: [a]\ntransitions:\n  a: [b]\n";
        assert_eq!(
            FsmDefinition::from_yaml(yaml),
            Err(DefinitionError::UnknownTarget {
                from: "a".to_string(),
                to: "b".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_initial_rejected() {
        let yaml = "initial: z\nstates: [a]\n";
        assert!(matches!(
            FsmDefinition::from_yaml(yaml),
            Err(DefinitionError::UnknownInitial(_))
        ));
    }

    #[test]
    fn test_builder_declares_states() {
        let def = FsmDefinition::new("t", "a").transition("a", "b");
        assert!(def.validate().is_ok());
        assert!(def.is_valid_state("b"));
        assert_eq!(def.terminal_states(), vec!["b"]);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let def = FsmDefinition::new("t", "Start");
        assert_eq!(
            def.validate(),
            Err(DefinitionError::InvalidName("Start".to_string()))
        );
    }
}
