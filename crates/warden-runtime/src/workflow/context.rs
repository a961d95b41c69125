//! Per-run workflow state.

use tokio::time::Instant;
use warden_core::{BudgetConsumed, Phase, StopReason, WorkflowOutcome};

use super::executor::PhaseReport;

/// State owned by one running workflow.
///
/// Phase executors get a shared reference; only the orchestrator mutates
/// it, once per phase.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    phase: Phase,
    iteration_count: u32,
    subagent_call_count: u32,
    started: Instant,
    confidence: f64,
    evidence_log: Vec<String>,
    uncertainties: Vec<String>,
    stop_reason: Option<StopReason>,
    strategy_switches: u32,
}

impl WorkflowContext {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Intake,
            iteration_count: 0,
            subagent_call_count: 0,
            started: Instant::now(),
            confidence: 0.0,
            evidence_log: Vec::new(),
            uncertainties: Vec::new(),
            stop_reason: None,
            strategy_switches: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed or in-progress `plan` entries.
    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn subagent_call_count(&self) -> u32 {
        self.subagent_call_count
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn evidence_log(&self) -> &[String] {
        &self.evidence_log
    }

    pub fn uncertainties(&self) -> &[String] {
        &self.uncertainties
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn strategy_switches(&self) -> u32 {
        self.strategy_switches
    }

    pub fn budget_consumed(&self) -> BudgetConsumed {
        BudgetConsumed {
            iterations: self.iteration_count,
            subagent_calls: self.subagent_call_count,
            wall_time: self.elapsed(),
        }
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        if phase == Phase::Plan {
            self.iteration_count += 1;
        }
        self.phase = phase;
    }

    /// Fold a phase report in. Returns how many evidence items were new.
    pub(crate) fn apply(&mut self, report: PhaseReport) -> usize {
        self.subagent_call_count = self.subagent_call_count.saturating_add(report.subagent_calls);
        if let Some(confidence) = report.confidence {
            self.confidence = confidence.clamp(0.0, 1.0);
        }

        let mut added = 0;
        for item in report.evidence {
            if !self.evidence_log.contains(&item) {
                self.evidence_log.push(item);
                added += 1;
            }
        }

        if let Some(uncertainties) = report.uncertainties {
            self.uncertainties = uncertainties;
        }
        added
    }

    pub(crate) fn record_strategy_switch(&mut self) {
        self.strategy_switches += 1;
    }

    pub(crate) fn stop(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
        self.phase = Phase::Done;
    }

    /// Serialize the terminal state of a stopped run.
    pub(crate) fn into_outcome(self, stop_reason: StopReason) -> WorkflowOutcome {
        let budget_consumed = self.budget_consumed();
        WorkflowOutcome {
            stop_reason,
            confidence: self.confidence,
            evidence_summary: self.evidence_log,
            uncertainties_remaining: self.uncertainties,
            budget_consumed,
            strategy_switches: self.strategy_switches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_dedupes_evidence_and_counts_calls() {
        let mut ctx = WorkflowContext::new();
        let added = ctx.apply(PhaseReport {
            evidence: vec!["a".into(), "b".into()],
            subagent_calls: 2,
            ..Default::default()
        });
        assert_eq!(added, 2);

        let added = ctx.apply(PhaseReport {
            evidence: vec!["b".into(), "c".into()],
            subagent_calls: 1,
            confidence: Some(1.7),
            ..Default::default()
        });
        assert_eq!(added, 1);
        assert_eq!(ctx.evidence_log(), ["a", "b", "c"]);
        assert_eq!(ctx.subagent_call_count(), 3);
        assert_eq!(ctx.confidence(), 1.0);
    }

    #[test]
    fn test_plan_entry_counts_iteration() {
        let mut ctx = WorkflowContext::new();
        ctx.enter(Phase::Plan);
        ctx.enter(Phase::Act);
        ctx.enter(Phase::Plan);
        assert_eq!(ctx.iteration_count(), 2);
        assert_eq!(ctx.phase(), Phase::Plan);
    }
}
