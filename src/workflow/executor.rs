//! Workflow executor.
//!
//! Drives a run from an initial stage to a terminal marker:
//! 1. Invoke the current stage's operation (the feedback cycle runs as one
//!    composite stage)
//! 2. Record the result in the state
//! 3. Apply the transition function to pick the next stage
//!
//! Once a terminal is reached the cleanup tail runs exactly once, the state
//! is sealed, and the outcome is compiled. Stages run strictly one after the
//! other; the executor never retries.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::WorkflowConfig;
use crate::error::ConfigError;
use crate::workflow::feedback::FeedbackLoopController;
use crate::workflow::observer::{NoopObserver, StageObserver, TransitionEvent, notify};
use crate::workflow::outcome;
use crate::workflow::registry::{Pipeline, StageKind};
use crate::workflow::stage::invoke;
use crate::workflow::state::WorkflowState;
use crate::workflow::types::{FinalOutcome, FinalStatus, StageResult, StageTarget};

/// Runs pipelines against fresh state.
pub struct Executor {
    pipeline: Arc<Pipeline>,
    config: WorkflowConfig,
    observer: Arc<dyn StageObserver>,
}

impl Executor {
    /// Create an executor. Fails if the configuration is invalid.
    pub fn new(pipeline: Arc<Pipeline>, config: WorkflowConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pipeline,
            config,
            observer: Arc::new(NoopObserver),
        })
    }

    /// Attach an observer notified once per stage invocation.
    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run from the pipeline's entry stage.
    pub async fn run_from_entry(&self) -> Result<FinalOutcome, ConfigError> {
        let entry = self.pipeline.entry().to_string();
        self.run(&entry).await
    }

    /// Run the pipeline starting at `initial_stage`.
    ///
    /// Only an unknown initial stage is an error; every stage failure ends up
    /// in the returned outcome.
    pub async fn run(&self, initial_stage: &str) -> Result<FinalOutcome, ConfigError> {
        if self.pipeline.stage(initial_stage).is_none() {
            return Err(ConfigError::UnknownStage(initial_stage.to_string()));
        }

        let mut state = WorkflowState::initialize(self.config.max_iterations)
            .with_cycle_stages(self.pipeline.cycle_stage_names());
        let run_id = state.run_id();
        info!(
            run_id = %run_id,
            initial_stage,
            max_iterations = self.config.max_iterations,
            "Starting workflow run"
        );

        let mut current = StageTarget::stage(initial_stage);
        while let StageTarget::Stage(name) = current {
            let definition = self
                .pipeline
                .stage(&name)
                .ok_or_else(|| ConfigError::UnknownStage(name.clone()))?;

            let result = match definition.kind() {
                StageKind::Operation(op) => {
                    let result = invoke(op.as_ref(), &state).await;
                    self.record(&mut state, &name, result)
                }
                StageKind::FeedbackCycle(cycle) => {
                    let result = FeedbackLoopController::new(cycle, self.observer.as_ref())
                        .run(&mut state)
                        .await;
                    match state.record_composite(&name, result.clone()) {
                        Ok(()) => result,
                        Err(e) => {
                            error!(stage = %name, "Failed to record feedback cycle: {}", e);
                            StageResult::failure(e.to_string())
                        }
                    }
                }
            };

            if !result.is_success() {
                warn!(
                    run_id = %run_id,
                    stage = %name,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Stage failed"
                );
            }

            let next = self.pipeline.transition(&name, &result, &state)?;
            info!(
                run_id = %run_id,
                stage = %name,
                status = %result.status,
                next = %next,
                "Stage complete"
            );
            current = next;
        }

        let final_status = match current {
            StageTarget::SuccessTerminal if state.forced_approval() => FinalStatus::ForcedApproval,
            StageTarget::SuccessTerminal => FinalStatus::Success,
            _ => FinalStatus::Failure,
        };

        self.run_cleanup(&mut state).await;

        if let Err(e) = state.finish(final_status) {
            error!(run_id = %run_id, "Failed to seal workflow state: {}", e);
        }

        let outcome = outcome::compile(&state.snapshot());
        info!(
            run_id = %run_id,
            final_status = %outcome.final_status,
            iterations = outcome.iterations_used,
            stages = outcome.stage_trace.len(),
            "Workflow run finished"
        );
        Ok(outcome)
    }

    /// Record a stage result and notify the observer. A rejected write turns
    /// into a failure so the run still ends through the failure edges.
    fn record(&self, state: &mut WorkflowState, stage: &str, result: StageResult) -> StageResult {
        let result = match state.record(stage, result.clone()) {
            Ok(()) => result,
            Err(e) => {
                error!(stage = %stage, "Failed to record stage result: {}", e);
                StageResult::failure(e.to_string())
            }
        };
        notify(
            self.observer.as_ref(),
            TransitionEvent {
                run_id: state.run_id(),
                stage: stage.to_string(),
                status: result.status,
                iteration_count: state.iteration_count(),
                timestamp: Utc::now(),
            },
        );
        result
    }

    async fn run_cleanup(&self, state: &mut WorkflowState) {
        let cleanup = self.pipeline.cleanup();
        let result = invoke(cleanup.operation(), state).await;
        if !result.is_success() {
            warn!(
                stage = %cleanup.name(),
                error = result.error.as_deref().unwrap_or("unknown"),
                "Cleanup completed with errors"
            );
        }
        self.record(state, cleanup.name(), result);
    }
}
