//! Workflow phases, stop reasons, budgets and stagnation detection.
//!
//! The agent loop is fixed: `intake -> plan -> act -> synthesize -> check`,
//! then back to `plan` or on to `done`. Hard budgets are enforced here in
//! code, never delegated to the unit of work running each phase.

mod budget;
mod stagnation;

pub use budget::{BudgetConsumed, BudgetLimit, WorkflowBudget};
pub use stagnation::{StagnationConfig, StagnationDetector, StagnationSignal};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::fsm::FsmDefinition;

/// One phase of the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Plan,
    Act,
    Synthesize,
    Check,
    Done,
}

impl Phase {
    /// All phases in loop order.
    pub const ALL: [Phase; 6] = [
        Phase::Intake,
        Phase::Plan,
        Phase::Act,
        Phase::Synthesize,
        Phase::Check,
        Phase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Plan => "plan",
            Phase::Act => "act",
            Phase::Synthesize => "synthesize",
            Phase::Check => "check",
            Phase::Done => "done",
        }
    }

    /// The phase that follows when nothing forces an early stop.
    ///
    /// `check` loops back to `plan`; `done` has no successor.
    pub fn next_in_loop(&self) -> Option<Phase> {
        match self {
            Phase::Intake => Some(Phase::Plan),
            Phase::Plan => Some(Phase::Act),
            Phase::Act => Some(Phase::Synthesize),
            Phase::Synthesize => Some(Phase::Check),
            Phase::Check => Some(Phase::Plan),
            Phase::Done => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{}'", s))
    }
}

/// Why a workflow reached `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Confidence reached the success threshold
    Success,

    /// A hard budget ran out
    BudgetExhausted,

    /// A blocking question needs a human
    HumanRequired,

    /// Reported risk exceeded the configured threshold
    RiskThresholdExceeded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Success => "success",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::HumanRequired => "human_required",
            StopReason::RiskThresholdExceeded => "risk_threshold_exceeded",
        };
        f.write_str(s)
    }
}

/// Workflow tuning, loaded from the `workflow` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Hard limits for the whole run
    pub budget: WorkflowBudget,

    /// Smaller limits applied after a stagnation-driven strategy switch
    pub strategy_switch: WorkflowBudget,

    pub stagnation: StagnationConfig,

    /// Confidence at `check` that ends the run with `success`
    pub success_confidence: f64,

    /// Reported risk above this ends the run
    pub risk_threshold: f64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            budget: WorkflowBudget::default(),
            strategy_switch: WorkflowBudget::strategy_switch_default(),
            stagnation: StagnationConfig::default(),
            success_confidence: 0.8,
            risk_threshold: 0.7,
        }
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if !(0.0..=1.0).contains(&self.success_confidence) {
            problems.push("workflow.success_confidence must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.risk_threshold) {
            problems.push("workflow.risk_threshold must be within [0, 1]".to_string());
        }
        if self.budget.max_iterations == 0 {
            problems.push("workflow.budget.max_iterations must be positive".to_string());
        }
        if self.stagnation.identical_failures == 0 {
            problems.push("workflow.stagnation.identical_failures must be positive".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Terminal result of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub stop_reason: StopReason,

    /// Last confidence reported at `check`
    pub confidence: f64,

    /// One line per evidence item collected, in order
    pub evidence_summary: Vec<String>,

    /// Open questions and unresolved doubts at stop time
    pub uncertainties_remaining: Vec<String>,

    pub budget_consumed: BudgetConsumed,

    /// How many stagnation-driven strategy switches happened
    #[serde(default)]
    pub strategy_switches: u32,
}

/// The workflow state machine definition.
///
/// Loop edges plus an edge to `done` from every non-terminal phase, so any
/// phase can stop on a terminal condition.
pub fn workflow_definition() -> FsmDefinition {
    let mut definition = FsmDefinition::new("workflow", Phase::Intake.as_str());
    for phase in Phase::ALL {
        definition = definition.state(phase.as_str());
        if let Some(next) = phase.next_in_loop() {
            definition = definition
                .transition(phase.as_str(), next.as_str())
                .transition(phase.as_str(), Phase::Done.as_str());
        }
    }
    definition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_order() {
        let mut phase = Phase::Intake;
        let mut seen = vec![phase];
        for _ in 0..5 {
            phase = phase.next_in_loop().unwrap();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                Phase::Intake,
                Phase::Plan,
                Phase::Act,
                Phase::Synthesize,
                Phase::Check,
                Phase::Plan
            ]
        );
        assert!(Phase::Done.next_in_loop().is_none());
    }

    #[test]
    fn test_workflow_definition_edges() {
        let def = workflow_definition();
        assert!(def.validate().is_ok());
        assert!(def.allows("check", "plan"));
        assert!(def.allows("check", "done"));
        assert!(def.allows("act", "done"));
        assert!(!def.allows("plan", "check"));
        assert!(!def.allows("done", "plan"));
        assert_eq!(def.terminal_states(), vec!["done"]);
    }

    #[test]
    fn test_phase_round_trips_through_str() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        assert!("review".parse::<Phase>().is_err());
    }

    #[test]
    fn test_stop_reason_serialization() {
        let json = serde_json::to_string(&StopReason::RiskThresholdExceeded).unwrap();
        assert_eq!(json, "\"risk_threshold_exceeded\"");
        assert_eq!(StopReason::BudgetExhausted.to_string(), "budget_exhausted");
    }
}
