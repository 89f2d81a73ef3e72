//! Outcome reporter.

use crate::workflow::state::WorkflowState;
use crate::workflow::types::{FinalOutcome, FinalStatus};

/// Compile the final outcome of a run from its state snapshot.
///
/// A state that never reached a terminal is reported as a failure. The error
/// message is only reported for failed runs; a failing cleanup after a
/// successful run stays visible in the trace alone.
pub fn compile(state: &WorkflowState) -> FinalOutcome {
    let final_status = state.final_status().unwrap_or(FinalStatus::Failure);
    let error = match final_status {
        FinalStatus::Failure => Some(
            state
                .first_error()
                .unwrap_or("run ended without a recorded failure")
                .to_string(),
        ),
        FinalStatus::Success | FinalStatus::ForcedApproval => None,
    };

    FinalOutcome {
        run_id: state.run_id(),
        final_status,
        iterations_used: state.iteration_count(),
        stage_trace: state.trace().to_vec(),
        error,
    }
}
