//! Workflow state container.
//!
//! One `WorkflowState` is threaded through a run. It holds the latest result
//! per stage, the ordered stage trace, and the feedback-cycle bookkeeping.
//! Results are write-once except for stages inside the feedback cycle, which
//! are overwritten on every re-entry.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StateError;
use crate::workflow::types::{FinalStatus, StageOutcome, StageResult, TraceEntry};

/// Accumulated state of a single run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    run_id: Uuid,
    results: BTreeMap<String, StageResult>,
    #[serde(skip)]
    cycle_stages: HashSet<String>,
    trace: Vec<TraceEntry>,
    iteration_count: u32,
    max_iterations: u32,
    /// Latest evaluator note; replaced, never accumulated.
    feedback: String,
    forced_approval: bool,
    final_status: Option<FinalStatus>,
    first_error: Option<String>,
}

impl WorkflowState {
    /// Create an empty state for a new run.
    pub fn initialize(max_iterations: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            results: BTreeMap::new(),
            cycle_stages: HashSet::new(),
            trace: Vec::new(),
            iteration_count: 0,
            max_iterations,
            feedback: String::new(),
            forced_approval: false,
            final_status: None,
            first_error: None,
        }
    }

    /// Mark stages whose results may be overwritten on feedback-cycle re-entry.
    pub fn with_cycle_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cycle_stages.extend(stages.into_iter().map(Into::into));
        self
    }

    /// Record a stage result and append it to the trace.
    pub fn record(&mut self, stage: &str, result: StageResult) -> Result<(), StateError> {
        self.write(stage, result, None, true)
    }

    /// Record the summary of a composite stage without a trace entry.
    ///
    /// The feedback cycle's inner steps are traced individually; its own
    /// result is kept so later stages can read `approved`,
    /// `forced_approval` and `iterations`.
    pub fn record_composite(&mut self, stage: &str, result: StageResult) -> Result<(), StateError> {
        self.write(stage, result, None, false)
    }

    /// Record an evaluation step of the feedback cycle along with its verdict.
    pub fn record_evaluation(
        &mut self,
        stage: &str,
        result: StageResult,
        approved: bool,
    ) -> Result<(), StateError> {
        self.write(stage, result, Some(approved), true)
    }

    fn write(
        &mut self,
        stage: &str,
        result: StageResult,
        approved: Option<bool>,
        traced: bool,
    ) -> Result<(), StateError> {
        if let Some(status) = self.final_status {
            return Err(StateError::AlreadyTerminal(status.to_string()));
        }
        if self.results.contains_key(stage) && !self.cycle_stages.contains(stage) {
            return Err(StateError::AlreadyRecorded(stage.to_string()));
        }

        if result.status == StageOutcome::Failure && self.first_error.is_none() {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| format!("stage {stage} failed"));
            self.first_error = Some(message);
        }

        if traced {
            self.trace.push(TraceEntry {
                stage: stage.to_string(),
                status: result.status,
                iteration: self.iteration_count,
                approved,
                error: result.error.clone(),
                timestamp: Utc::now(),
            });
        }
        self.results.insert(stage.to_string(), result);
        Ok(())
    }

    /// Latest result recorded for a stage.
    pub fn get(&self, stage: &str) -> Option<&StageResult> {
        self.results.get(stage)
    }

    /// Immutable copy for reporting.
    pub fn snapshot(&self) -> WorkflowState {
        self.clone()
    }

    /// Enter the next feedback-cycle iteration, returning its 1-based number.
    pub fn begin_iteration(&mut self) -> Result<u32, StateError> {
        let next = self.iteration_count + 1;
        if next > self.max_iterations {
            return Err(StateError::IterationBudgetExceeded {
                next,
                max: self.max_iterations,
            });
        }
        self.iteration_count = next;
        Ok(next)
    }

    /// Replace the improvement note handed to the next draft.
    pub fn set_feedback(&mut self, feedback: impl Into<String>) {
        self.feedback = feedback.into();
    }

    pub fn mark_forced_approval(&mut self) {
        self.forced_approval = true;
    }

    /// Seal the run. No stage may record after this.
    pub fn finish(&mut self, status: FinalStatus) -> Result<(), StateError> {
        if let Some(existing) = self.final_status {
            return Err(StateError::AlreadyTerminal(existing.to_string()));
        }
        self.final_status = Some(status);
        Ok(())
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn results(&self) -> &BTreeMap<String, StageResult> {
        &self.results
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn feedback(&self) -> &str {
        &self.feedback
    }

    pub fn forced_approval(&self) -> bool {
        self.forced_approval
    }

    pub fn final_status(&self) -> Option<FinalStatus> {
        self.final_status
    }

    pub fn is_terminal(&self) -> bool {
        self.final_status.is_some()
    }

    pub fn first_error(&self) -> Option<&str> {
        self.first_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_starts_empty() {
        let state = WorkflowState::initialize(3);
        assert_eq!(state.iteration_count(), 0);
        assert_eq!(state.max_iterations(), 3);
        assert!(state.feedback().is_empty());
        assert!(state.trace().is_empty());
        assert!(!state.is_terminal());
    }

    #[test]
    fn record_is_write_once_outside_cycle() {
        let mut state = WorkflowState::initialize(3);
        state.record("fetch_email", StageResult::success()).unwrap();
        let err = state
            .record("fetch_email", StageResult::success())
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyRecorded(ref s) if s == "fetch_email"));
        assert_eq!(state.trace().len(), 1);
    }

    #[test]
    fn cycle_stages_may_be_overwritten() {
        let mut state = WorkflowState::initialize(3).with_cycle_stages(["draft_report"]);
        state
            .record("draft_report", StageResult::success().with("body", "v1"))
            .unwrap();
        state
            .record("draft_report", StageResult::success().with("body", "v2"))
            .unwrap();
        assert_eq!(state.get("draft_report").unwrap().payload["body"], "v2");
        assert_eq!(state.trace().len(), 2);
    }

    #[test]
    fn first_error_is_kept() {
        let mut state = WorkflowState::initialize(3);
        state
            .record("validate_data", StageResult::failure("bad weight"))
            .unwrap();
        state
            .record("cleanup", StageResult::failure("chrome still running"))
            .unwrap();
        assert_eq!(state.first_error(), Some("bad weight"));
    }

    #[test]
    fn begin_iteration_respects_budget() {
        let mut state = WorkflowState::initialize(2);
        assert_eq!(state.begin_iteration().unwrap(), 1);
        assert_eq!(state.begin_iteration().unwrap(), 2);
        let err = state.begin_iteration().unwrap_err();
        assert!(matches!(err, StateError::IterationBudgetExceeded { next: 3, max: 2 }));
        assert_eq!(state.iteration_count(), 2);
    }

    #[test]
    fn finished_state_rejects_records() {
        let mut state = WorkflowState::initialize(3);
        state.finish(FinalStatus::Success).unwrap();
        assert!(state.record("late", StageResult::success()).is_err());
        assert!(state.finish(FinalStatus::Failure).is_err());
    }

    #[test]
    fn trace_entries_carry_iteration_and_verdict() {
        let mut state = WorkflowState::initialize(3).with_cycle_stages(["evaluate_report"]);
        state.begin_iteration().unwrap();
        state
            .record_evaluation("evaluate_report", StageResult::success(), false)
            .unwrap();
        let entry = &state.trace()[0];
        assert_eq!(entry.iteration, 1);
        assert_eq!(entry.approved, Some(false));
    }

    #[test]
    fn composite_result_is_stored_untraced() {
        let mut state = WorkflowState::initialize(3);
        state
            .record_composite(
                "feedback_cycle",
                StageResult::success().with("forced_approval", true),
            )
            .unwrap();
        assert!(state.get("feedback_cycle").unwrap().flag("forced_approval"));
        assert!(state.trace().is_empty());
        assert!(state
            .record_composite("feedback_cycle", StageResult::success())
            .is_err());
    }

    #[test]
    fn feedback_is_replaced() {
        let mut state = WorkflowState::initialize(3);
        state.set_feedback("shorter intro");
        state.set_feedback("add weekly totals");
        assert_eq!(state.feedback(), "add weekly totals");
    }

    #[test]
    fn snapshot_is_independent() {
        let mut state = WorkflowState::initialize(3);
        let snap = state.snapshot();
        state.record("fetch_email", StageResult::success()).unwrap();
        assert!(snap.trace().is_empty());
        assert_eq!(snap.run_id(), state.run_id());
    }
}
