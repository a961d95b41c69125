//! The per-phase unit of work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use warden_core::{Failure, Phase};

use super::context::WorkflowContext;

/// What one phase produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseReport {
    /// Evidence items gathered; duplicates of earlier items are ignored
    pub evidence: Vec<String>,

    /// Subagent calls spent in this phase
    pub subagent_calls: u32,

    /// New overall confidence, if the phase assessed it
    pub confidence: Option<f64>,

    /// Replacement list of open uncertainties, if reported
    pub uncertainties: Option<Vec<String>>,

    /// A specific question only a human can answer
    pub blocking_question: Option<String>,

    /// Estimated risk of continuing, in `[0, 1]`
    pub risk: Option<f64>,
}

/// Runs the work behind each phase.
///
/// The orchestrator enforces budgets regardless of what is reported here.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn run_phase(&self, phase: Phase, context: &WorkflowContext) -> Result<PhaseReport, Failure>;
}
