//! The six-phase agent loop.
//!
//! `intake -> plan -> act -> synthesize -> check -> {plan | done}`, driven
//! through the FSM engine. Before every `plan` entry the hard budget is
//! checked; at every `check` the run may succeed or, when stagnation is
//! detected, switch strategy by narrowing what is left of the budget.
//!
//! Any phase may end the run early on a blocking question or on risk
//! above the configured threshold.

use std::sync::Arc;
use warden_core::{
    workflow_definition, Failure, FailureKind, Phase, StagnationDetector, StopReason, WorkflowConfig,
    WorkflowOutcome,
};

use super::context::WorkflowContext;
use super::executor::{PhaseExecutor, PhaseReport};
use crate::fsm::{Fsm, FsmBuilder, Observer, StateStore};
use crate::resilience::ReliabilityPipeline;

const ITERATION_PHASES: [Phase; 4] = [Phase::Plan, Phase::Act, Phase::Synthesize, Phase::Check];

/// Builder for [`Workflow`].
pub struct WorkflowBuilder {
    id: String,
    config: WorkflowConfig,
    executor: Option<Arc<dyn PhaseExecutor>>,
    pipeline: Option<(Arc<ReliabilityPipeline>, String)>,
    store: Option<Arc<dyn StateStore>>,
    observers: Vec<Arc<dyn Observer>>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: WorkflowConfig::default(),
            executor: None,
            pipeline: None,
            store: None,
            observers: Vec::new(),
        }
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Run every phase through `pipeline` under `resource`.
    pub fn pipeline(mut self, pipeline: Arc<ReliabilityPipeline>, resource: impl Into<String>) -> Self {
        self.pipeline = Some((pipeline, resource.into()));
        self
    }

    /// Persist phase changes.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Observe phase changes.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<Workflow, Failure> {
        let executor = self.executor.ok_or_else(|| {
            Failure::new(FailureKind::Config, "workflow has no phase executor")
        })?;
        self.config.validate().map_err(|problems| {
            Failure::new(FailureKind::Config, problems.join("; "))
        })?;

        Ok(Workflow {
            id: self.id,
            config: self.config,
            executor,
            pipeline: self.pipeline,
            store: self.store,
            observers: self.observers,
        })
    }
}

/// A configured agent loop. Each [`run`](Self::run) starts from `intake`
/// with a fresh context.
pub struct Workflow {
    id: String,
    config: WorkflowConfig,
    executor: Arc<dyn PhaseExecutor>,
    pipeline: Option<(Arc<ReliabilityPipeline>, String)>,
    store: Option<Arc<dyn StateStore>>,
    observers: Vec<Arc<dyn Observer>>,
}

/// Result of running one phase.
enum Step {
    Continue { new_evidence: usize },
    Stop(StopReason),
}

impl Workflow {
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Drive the loop to `done`.
    ///
    /// Phase failures do not end the run; they feed stagnation detection.
    /// Errors are returned only when the phase machine itself fails.
    pub async fn run(&self) -> Result<WorkflowOutcome, Failure> {
        let mut fsm = self.machine()?;
        let mut ctx = WorkflowContext::new();
        let mut detector = StagnationDetector::new(self.config.stagnation.clone());
        let mut budget = self.config.budget.clone();

        tracing::info!(workflow = %self.id, "Workflow started");

        if let Step::Stop(reason) = self.run_phase(Phase::Intake, &mut ctx, &mut detector).await {
            return self.finish(&mut fsm, ctx, reason).await;
        }

        loop {
            if let Some(limit) = budget.exhausted_by(&ctx.budget_consumed()) {
                tracing::info!(workflow = %self.id, limit = ?limit, iterations = ctx.iteration_count(), "Budget exhausted");
                return self.finish(&mut fsm, ctx, StopReason::BudgetExhausted).await;
            }

            let mut iteration_evidence = 0;
            for phase in ITERATION_PHASES {
                fsm.transition_to(phase.as_str(), &ctx).await?;
                ctx.enter(phase);

                match self.run_phase(phase, &mut ctx, &mut detector).await {
                    Step::Continue { new_evidence } => iteration_evidence += new_evidence,
                    Step::Stop(reason) => return self.finish(&mut fsm, ctx, reason).await,
                }
            }

            if ctx.confidence() >= self.config.success_confidence {
                return self.finish(&mut fsm, ctx, StopReason::Success).await;
            }

            if let Some(signal) = detector.end_iteration(iteration_evidence, ctx.confidence()) {
                budget = budget.narrowed(&ctx.budget_consumed(), &self.config.strategy_switch);
                detector.reset();
                ctx.record_strategy_switch();
                tracing::warn!(
                    workflow = %self.id,
                    signal = ?signal,
                    max_iterations = budget.max_iterations,
                    "Stagnation detected, switching strategy"
                );
            }
        }
    }

    fn machine(&self) -> Result<Fsm<WorkflowContext>, Failure> {
        let mut builder = FsmBuilder::new(self.id.clone(), workflow_definition());
        if let Some(store) = &self.store {
            builder = builder.store(store.clone());
        }
        for observer in &self.observers {
            builder = builder.observer(observer.clone());
        }
        builder.build()
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut WorkflowContext,
        detector: &mut StagnationDetector,
    ) -> Step {
        let report = match self.invoke(phase, ctx).await {
            Ok(report) => report,
            Err(failure) => {
                tracing::warn!(workflow = %self.id, phase = %phase, error = %failure, "Phase failed");
                detector.record_failure(&failure.signature());
                PhaseReport::default()
            }
        };

        let blocking_question = report.blocking_question.clone();
        let risk = report.risk;
        let new_evidence = ctx.apply(report);

        if let Some(question) = blocking_question {
            tracing::info!(workflow = %self.id, phase = %phase, question = %question, "Human input required");
            return Step::Stop(StopReason::HumanRequired);
        }
        if let Some(risk) = risk {
            if risk > self.config.risk_threshold {
                tracing::warn!(workflow = %self.id, phase = %phase, risk, "Risk threshold exceeded");
                return Step::Stop(StopReason::RiskThresholdExceeded);
            }
        }
        Step::Continue { new_evidence }
    }

    async fn invoke(&self, phase: Phase, ctx: &WorkflowContext) -> Result<PhaseReport, Failure> {
        match &self.pipeline {
            Some((pipeline, resource)) => {
                pipeline
                    .execute(resource, || self.executor.run_phase(phase, ctx))
                    .await
            }
            None => self.executor.run_phase(phase, ctx).await,
        }
    }

    async fn finish(
        &self,
        fsm: &mut Fsm<WorkflowContext>,
        mut ctx: WorkflowContext,
        reason: StopReason,
    ) -> Result<WorkflowOutcome, Failure> {
        fsm.transition_to(Phase::Done.as_str(), &ctx).await?;
        ctx.stop(reason);
        tracing::info!(
            workflow = %self.id,
            stop_reason = %reason,
            iterations = ctx.iteration_count(),
            confidence = ctx.confidence(),
            "Workflow finished"
        );
        Ok(ctx.into_outcome(reason))
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("pipeline_resource", &self.pipeline.as_ref().map(|(_, resource)| resource))
            .field("store", &self.store.is_some())
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}
