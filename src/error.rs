//! Error types for the reporting workflow.

use std::time::Duration;

use crate::workflow::types::StageOutcome;

/// Top-level error type for the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Pipeline and runtime configuration errors.
///
/// Raised at registration time or while loading configuration, always before
/// any stage runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Stage {stage} has no unconditional {outcome} edge")]
    MissingEdge { stage: String, outcome: StageOutcome },

    #[error("Stage {0} registered more than once")]
    DuplicateStage(String),

    #[error("Stage {0} is not registered")]
    UnknownStage(String),

    #[error("Stage {stage} routes to unknown stage {target}")]
    UnknownTarget { stage: String, target: String },

    #[error("Stage graph contains a cycle through {stage}")]
    Cycle { stage: String },

    #[error("No cleanup stage registered")]
    MissingCleanup,

    #[error("Pipeline has no stages")]
    EmptyPipeline,

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure of a single stage operation.
///
/// Every variant is converted into a failure `StageResult` by the executor and
/// routed through the stage's failure edges.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors raised by capability handlers (external collaborators).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("No handler registered for capability {0}")]
    NotFound(String),

    #[error("Handler {name} failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Handler {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Handler {name} returned invalid output: {reason}")]
    InvalidOutput { name: String, reason: String },

    #[error("Handler {name} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Violations of the state container's write rules.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Stage {0} already recorded a result")]
    AlreadyRecorded(String),

    #[error("Iteration {next} exceeds the budget of {max}")]
    IterationBudgetExceeded { next: u32, max: u32 },

    #[error("Run already finished with status {0}")]
    AlreadyTerminal(String),
}

/// Result type alias for the workflow engine.
pub type Result<T> = std::result::Result<T, Error>;
