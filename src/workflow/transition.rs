//! Transition edges and first-match edge selection.
//!
//! Each stage declares an ordered list of edges. An edge fires when the
//! stage's outcome matches and its optional predicate holds; the first edge
//! that fires decides the next stage. Registration guarantees an
//! unconditional edge for both outcomes, so selection is total.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::workflow::state::WorkflowState;
use crate::workflow::types::{StageOutcome, StageResult, StageTarget};

/// Predicate over a stage result and the state it was produced from.
pub type EdgePredicate = Arc<dyn Fn(&StageResult, &WorkflowState) -> bool + Send + Sync>;

#[derive(Clone)]
struct EdgeCondition {
    label: String,
    predicate: EdgePredicate,
}

/// A conditional outgoing edge of a stage.
#[derive(Clone)]
pub struct TransitionEdge {
    on: StageOutcome,
    condition: Option<EdgeCondition>,
    target: StageTarget,
}

impl TransitionEdge {
    /// Unconditional edge taken when the stage succeeds.
    pub fn on_success(target: StageTarget) -> Self {
        Self {
            on: StageOutcome::Success,
            condition: None,
            target,
        }
    }

    /// Unconditional edge taken when the stage fails.
    pub fn on_failure(target: StageTarget) -> Self {
        Self {
            on: StageOutcome::Failure,
            condition: None,
            target,
        }
    }

    /// Edge taken when the outcome matches and `predicate` holds.
    pub fn when<F>(on: StageOutcome, label: impl Into<String>, predicate: F, target: StageTarget) -> Self
    where
        F: Fn(&StageResult, &WorkflowState) -> bool + Send + Sync + 'static,
    {
        Self {
            on,
            condition: Some(EdgeCondition {
                label: label.into(),
                predicate: Arc::new(predicate),
            }),
            target,
        }
    }

    pub fn outcome(&self) -> StageOutcome {
        self.on
    }

    pub fn target(&self) -> &StageTarget {
        &self.target
    }

    pub fn is_unconditional(&self) -> bool {
        self.condition.is_none()
    }

    /// Label of the condition, or the outcome name for unconditional edges.
    pub fn label(&self) -> String {
        match &self.condition {
            Some(cond) => cond.label.clone(),
            None => self.on.to_string(),
        }
    }

    pub fn matches(&self, result: &StageResult, state: &WorkflowState) -> bool {
        if result.status != self.on {
            return false;
        }
        match &self.condition {
            Some(cond) => (cond.predicate)(result, state),
            None => true,
        }
    }
}

impl fmt::Debug for TransitionEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionEdge")
            .field("on", &self.on)
            .field("condition", &self.condition.as_ref().map(|c| &c.label))
            .field("target", &self.target)
            .finish()
    }
}

/// Success advances to `next`; failure ends the run.
pub fn binary_edges(next: StageTarget) -> Vec<TransitionEdge> {
    vec![
        TransitionEdge::on_success(next),
        TransitionEdge::on_failure(StageTarget::FailureTerminal),
    ]
}

/// Predicate that holds when the result's payload has `key == true`.
pub fn payload_flag(key: &'static str) -> impl Fn(&StageResult, &WorkflowState) -> bool + Send + Sync {
    move |result, _state| result.flag(key)
}

/// Pick the first edge matching `result`.
///
/// Falls back to the failure terminal when nothing matches, which only
/// happens for edge lists that bypassed registration. A predicate that
/// panics also routes to the failure terminal, so the run still reaches
/// its cleanup tail.
pub fn select_target(
    stage: &str,
    edges: &[TransitionEdge],
    result: &StageResult,
    state: &WorkflowState,
) -> StageTarget {
    for edge in edges {
        let matched = panic::catch_unwind(AssertUnwindSafe(|| edge.matches(result, state)));
        match matched {
            Ok(true) => {
                debug!(
                    stage = %stage,
                    edge = %edge.label(),
                    target = %edge.target,
                    "Edge matched"
                );
                return edge.target.clone();
            }
            Ok(false) => {}
            Err(_) => {
                error!(stage = %stage, edge = %edge.label(), "Edge predicate panicked");
                return StageTarget::FailureTerminal;
            }
        }
    }
    debug!(stage = %stage, status = %result.status, "No edge matched");
    StageTarget::FailureTerminal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconcile_edges() -> Vec<TransitionEdge> {
        vec![
            TransitionEdge::when(
                StageOutcome::Success,
                "already_exists",
                payload_flag("data_exists"),
                StageTarget::SuccessTerminal,
            ),
            TransitionEdge::on_success(StageTarget::stage("validate_data")),
            TransitionEdge::on_failure(StageTarget::FailureTerminal),
        ]
    }

    #[test]
    fn binary_edges_route_failure_to_terminal() {
        let edges = binary_edges(StageTarget::stage("fetch_email"));
        let state = WorkflowState::initialize(3);
        assert_eq!(
            select_target("check", &edges, &StageResult::success(), &state),
            StageTarget::stage("fetch_email")
        );
        assert_eq!(
            select_target("check", &edges, &StageResult::failure("x"), &state),
            StageTarget::FailureTerminal
        );
    }

    #[test]
    fn conditional_edge_wins_when_first() {
        let state = WorkflowState::initialize(3);
        let exists = StageResult::success().with("data_exists", true);
        let fresh = StageResult::success().with("data_exists", false);
        let edges = reconcile_edges();

        assert_eq!(
            select_target("reconcile_data", &edges, &exists, &state),
            StageTarget::SuccessTerminal
        );
        assert_eq!(
            select_target("reconcile_data", &edges, &fresh, &state),
            StageTarget::stage("validate_data")
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let state = WorkflowState::initialize(3);
        let result = StageResult::success().with("data_exists", true);
        let edges = reconcile_edges();
        let first = select_target("reconcile_data", &edges, &result, &state);
        for _ in 0..10 {
            assert_eq!(select_target("reconcile_data", &edges, &result, &state), first);
        }
    }

    #[test]
    fn unmatched_result_fails_closed() {
        let state = WorkflowState::initialize(3);
        let edges = vec![TransitionEdge::on_success(StageTarget::SuccessTerminal)];
        assert_eq!(
            select_target("orphan", &edges, &StageResult::failure("boom"), &state),
            StageTarget::FailureTerminal
        );
    }

    #[test]
    fn panicking_predicate_fails_closed() {
        let state = WorkflowState::initialize(3);
        let edges = vec![
            TransitionEdge::when(
                StageOutcome::Success,
                "explodes",
                |_: &StageResult, _: &WorkflowState| panic!("bad payload index"),
                StageTarget::SuccessTerminal,
            ),
            TransitionEdge::on_success(StageTarget::stage("validate_data")),
        ];
        assert_eq!(
            select_target("reconcile_data", &edges, &StageResult::success(), &state),
            StageTarget::FailureTerminal
        );
    }

    #[test]
    fn edge_labels() {
        let edges = reconcile_edges();
        assert_eq!(edges[0].label(), "already_exists");
        assert_eq!(edges[1].label(), "success");
        assert!(!edges[0].is_unconditional());
        assert!(edges[2].is_unconditional());
    }
}
