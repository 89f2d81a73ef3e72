//! Feedback-loop controller.
//!
//! Wraps a draft/evaluate pair as one composite stage. Each iteration drafts
//! with the latest evaluator feedback, then evaluates the fresh draft. The
//! loop is a bounded `for` over the iteration budget: it exits on approval,
//! on a draft or evaluation failure, or after the last allowed iteration with
//! a forced approval that carries the last draft forward.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::workflow::evaluation::Evaluation;
use crate::workflow::observer::{StageObserver, TransitionEvent, notify};
use crate::workflow::stage::{StageOperation, invoke};
use crate::workflow::state::WorkflowState;
use crate::workflow::types::{StageOutcome, StageResult};

/// The draft/evaluate pair of a feedback cycle.
#[derive(Clone)]
pub struct FeedbackCycle {
    draft_name: String,
    draft: Arc<dyn StageOperation>,
    evaluate_name: String,
    evaluate: Arc<dyn StageOperation>,
}

impl FeedbackCycle {
    pub fn new(
        draft_name: impl Into<String>,
        draft: Arc<dyn StageOperation>,
        evaluate_name: impl Into<String>,
        evaluate: Arc<dyn StageOperation>,
    ) -> Self {
        Self {
            draft_name: draft_name.into(),
            draft,
            evaluate_name: evaluate_name.into(),
            evaluate,
        }
    }

    pub fn draft_name(&self) -> &str {
        &self.draft_name
    }

    pub fn evaluate_name(&self) -> &str {
        &self.evaluate_name
    }
}

impl std::fmt::Debug for FeedbackCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackCycle")
            .field("draft", &self.draft_name)
            .field("evaluate", &self.evaluate_name)
            .finish()
    }
}

/// Drives one pass of a feedback cycle against a run's state.
pub struct FeedbackLoopController<'a> {
    cycle: &'a FeedbackCycle,
    observer: &'a dyn StageObserver,
}

impl<'a> FeedbackLoopController<'a> {
    pub fn new(cycle: &'a FeedbackCycle, observer: &'a dyn StageObserver) -> Self {
        Self { cycle, observer }
    }

    /// Run the cycle to completion and return the composite stage result.
    ///
    /// Success payload: `approved`, `forced_approval`, `iterations`, `score`.
    /// A failing draft or evaluation returns a failure immediately.
    pub async fn run(&self, state: &mut WorkflowState) -> StageResult {
        let budget = state.max_iterations();

        for _ in 0..budget {
            let iteration = match state.begin_iteration() {
                Ok(i) => i,
                Err(e) => return StageResult::failure(e.to_string()),
            };
            info!(
                iteration,
                max_iterations = budget,
                has_feedback = !state.feedback().is_empty(),
                "Drafting report"
            );

            let draft = invoke(self.cycle.draft.as_ref(), state).await;
            let draft_ok = draft.is_success();
            let draft_error = draft.error.clone();
            if let Err(e) = state.record(&self.cycle.draft_name, draft) {
                return StageResult::failure(e.to_string());
            }
            self.emit(state, &self.cycle.draft_name, draft_ok);
            if !draft_ok {
                warn!(iteration, "Draft failed, aborting feedback cycle");
                return aborted(draft_error, iteration);
            }

            let evaluated = invoke(self.cycle.evaluate.as_ref(), state).await;
            if !evaluated.is_success() {
                let error = evaluated.error.clone();
                if let Err(e) = state.record(&self.cycle.evaluate_name, evaluated) {
                    return StageResult::failure(e.to_string());
                }
                self.emit(state, &self.cycle.evaluate_name, false);
                warn!(iteration, "Evaluation failed, aborting feedback cycle");
                return aborted(error, iteration);
            }

            let verdict = Evaluation::from_result(&evaluated);
            if let Err(e) =
                state.record_evaluation(&self.cycle.evaluate_name, evaluated, verdict.approved)
            {
                return StageResult::failure(e.to_string());
            }
            self.emit(state, &self.cycle.evaluate_name, true);

            if verdict.approved {
                info!(iteration, score = ?verdict.score, "Draft approved");
                return exit_result(&verdict, iteration, false);
            }

            if iteration < budget {
                info!(iteration, "Draft rejected, revising");
                state.set_feedback(verdict.feedback);
                continue;
            }

            warn!(
                iteration,
                max_iterations = budget,
                "Iteration budget exhausted, forcing approval of last draft"
            );
            state.mark_forced_approval();
            return exit_result(&verdict, iteration, true);
        }

        StageResult::failure("feedback cycle has no iteration budget")
    }

    fn emit(&self, state: &WorkflowState, stage: &str, ok: bool) {
        let status = if ok {
            StageOutcome::Success
        } else {
            StageOutcome::Failure
        };
        notify(
            self.observer,
            TransitionEvent {
                run_id: state.run_id(),
                stage: stage.to_string(),
                status,
                iteration_count: state.iteration_count(),
                timestamp: Utc::now(),
            },
        );
    }
}

fn exit_result(verdict: &Evaluation, iteration: u32, forced: bool) -> StageResult {
    let score = verdict
        .score
        .map(serde_json::Value::from)
        .unwrap_or(serde_json::Value::Null);
    StageResult::success()
        .with("approved", verdict.approved)
        .with("forced_approval", forced)
        .with("iterations", iteration)
        .with("score", score)
}

fn aborted(error: Option<String>, iteration: u32) -> StageResult {
    StageResult::failure(error.unwrap_or_else(|| "feedback cycle step failed".to_string()))
        .with("iterations", iteration)
}
