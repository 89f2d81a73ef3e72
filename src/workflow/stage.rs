//! Stage operation contract.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::StageError;
use crate::workflow::state::WorkflowState;
use crate::workflow::types::StageResult;

/// A pipeline unit's operation.
///
/// Implementations may do async I/O internally; the executor awaits one
/// operation at a time. Returning `Err` is equivalent to returning a failure
/// result: both are routed through the stage's failure edges.
#[async_trait]
pub trait StageOperation: Send + Sync {
    async fn execute(&self, state: &WorkflowState) -> Result<StageResult, StageError>;
}

/// Adapter turning a synchronous closure into a stage operation.
pub struct FnStage<F> {
    f: F,
}

impl<F> FnStage<F>
where
    F: Fn(&WorkflowState) -> Result<StageResult, StageError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> StageOperation for FnStage<F>
where
    F: Fn(&WorkflowState) -> Result<StageResult, StageError> + Send + Sync,
{
    async fn execute(&self, state: &WorkflowState) -> Result<StageResult, StageError> {
        (self.f)(state)
    }
}

/// Shorthand for `Arc::new(FnStage::new(f))`.
pub fn stage_fn<F>(f: F) -> Arc<dyn StageOperation>
where
    F: Fn(&WorkflowState) -> Result<StageResult, StageError> + Send + Sync + 'static,
{
    Arc::new(FnStage::new(f))
}

/// Run an operation and fold every way it can fail into a failure result.
///
/// Returned errors and panics both become `StageResult::failure` with the
/// error message, so callers handle declared and raised failures alike.
pub(crate) async fn invoke(op: &dyn StageOperation, state: &WorkflowState) -> StageResult {
    match AssertUnwindSafe(op.execute(state)).catch_unwind().await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => StageResult::failure(e.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            StageResult::failure(StageError::Panicked(message).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returned_error_becomes_failure() {
        let op = stage_fn(|_| Err(StageError::Failed("db offline".into())));
        let state = WorkflowState::initialize(3);
        let result = invoke(op.as_ref(), &state).await;
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("db offline"));
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let op = stage_fn(|_| panic!("parser exploded"));
        let state = WorkflowState::initialize(3);
        let result = invoke(op.as_ref(), &state).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("parser exploded"));
    }

    #[tokio::test]
    async fn success_passes_through() {
        let op = stage_fn(|_| Ok(StageResult::success().with("rows", 4)));
        let state = WorkflowState::initialize(3);
        let result = invoke(op.as_ref(), &state).await;
        assert!(result.is_success());
        assert_eq!(result.payload["rows"], 4);
    }
}
