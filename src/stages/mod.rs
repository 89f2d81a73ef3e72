//! Stage collaborators and the standard reporting pipeline.
//!
//! The engine in `crate::workflow` knows nothing about mail, databases or
//! models. This module supplies:
//! - `HandlerRegistry` / `HandlerStage` for capability-keyed collaborators
//! - `CommandHandler` for collaborators that run as external processes
//! - `RetryingHandler` for per-collaborator retry strategies
//! - the built-in `ModelAssignmentCheck` and `RecordReconciler` stages
//! - `standard_pipeline`, the ten-step reporting workflow

pub mod command;
pub mod handler;
pub mod model_check;
pub mod reconcile;
pub mod retry;

pub use command::CommandHandler;
pub use handler::{HandlerRegistry, HandlerStage, StageHandler};
pub use model_check::ModelAssignmentCheck;
pub use reconcile::RecordReconciler;
pub use retry::{RetryPolicy, RetryingHandler};

use std::sync::Arc;

use crate::config::WorkflowConfig;
use crate::error::{self, ConfigError};
use crate::workflow::executor::Executor;
use crate::workflow::feedback::FeedbackCycle;
use crate::workflow::observer::StageObserver;
use crate::workflow::registry::Pipeline;
use crate::workflow::stage::StageOperation;
use crate::workflow::transition::{TransitionEdge, binary_edges, payload_flag};
use crate::workflow::types::{FinalOutcome, StageOutcome, StageTarget};

pub const MODEL_CONFIG_VALIDATION: &str = "model_config_validation";
pub const FETCH_EMAIL: &str = "fetch_email";
pub const FETCH_DATABASE: &str = "fetch_database";
pub const RECONCILE_DATA: &str = "reconcile_data";
pub const VALIDATE_DATA: &str = "validate_data";
pub const PERSIST_ENTRY: &str = "persist_entry";
pub const FEEDBACK_CYCLE: &str = "feedback_cycle";
pub const DRAFT_REPORT: &str = "draft_report";
pub const EVALUATE_REPORT: &str = "evaluate_report";
pub const SEND_REPORT: &str = "send_report";
pub const CLEANUP: &str = "cleanup";

/// Stages that call a model and therefore need a model assignment.
pub const MODEL_STAGES: [&str; 4] = [VALIDATE_DATA, RECONCILE_DATA, DRAFT_REPORT, EVALUATE_REPORT];

/// Capabilities served by external handlers in the standard pipeline.
pub const EXTERNAL_CAPABILITIES: [&str; 7] = [
    FETCH_EMAIL,
    FETCH_DATABASE,
    VALIDATE_DATA,
    PERSIST_ENTRY,
    DRAFT_REPORT,
    EVALUATE_REPORT,
    SEND_REPORT,
];

/// Operations backing each step of the standard pipeline.
#[derive(Clone)]
pub struct StandardStages {
    pub model_config_validation: Arc<dyn StageOperation>,
    pub fetch_email: Arc<dyn StageOperation>,
    pub fetch_database: Arc<dyn StageOperation>,
    pub reconcile_data: Arc<dyn StageOperation>,
    pub validate_data: Arc<dyn StageOperation>,
    pub persist_entry: Arc<dyn StageOperation>,
    pub draft_report: Arc<dyn StageOperation>,
    pub evaluate_report: Arc<dyn StageOperation>,
    pub send_report: Arc<dyn StageOperation>,
    pub cleanup: Arc<dyn StageOperation>,
}

impl StandardStages {
    /// Wire the built-in checks plus one `HandlerStage` per external
    /// capability (and `cleanup`), resolved through `registry` at run time.
    pub fn from_registry(registry: Arc<HandlerRegistry>, config: &WorkflowConfig) -> Self {
        let handler = |capability: &str| -> Arc<dyn StageOperation> {
            Arc::new(HandlerStage::new(Arc::clone(&registry), capability))
        };
        Self {
            model_config_validation: Arc::new(ModelAssignmentCheck::new(
                MODEL_STAGES,
                config.clone(),
            )),
            fetch_email: handler(FETCH_EMAIL),
            fetch_database: handler(FETCH_DATABASE),
            reconcile_data: Arc::new(RecordReconciler::new(FETCH_EMAIL, FETCH_DATABASE)),
            validate_data: handler(VALIDATE_DATA),
            persist_entry: handler(PERSIST_ENTRY),
            draft_report: handler(DRAFT_REPORT),
            evaluate_report: handler(EVALUATE_REPORT),
            send_report: handler(SEND_REPORT),
            cleanup: handler(CLEANUP),
        }
    }
}

/// Build the standard reporting pipeline.
///
/// Every step advances on success and ends the run on failure, except
/// `reconcile_data`, which goes straight to the success terminal when the
/// record is already stored.
pub fn standard_pipeline(stages: StandardStages) -> Result<Pipeline, ConfigError> {
    let next = StageTarget::stage;

    let mut reconcile_edges = vec![TransitionEdge::when(
        StageOutcome::Success,
        "already_exists",
        payload_flag("data_exists"),
        StageTarget::SuccessTerminal,
    )];
    reconcile_edges.extend(binary_edges(next(VALIDATE_DATA)));

    Pipeline::builder()
        .stage(
            MODEL_CONFIG_VALIDATION,
            stages.model_config_validation,
            binary_edges(next(FETCH_EMAIL)),
        )
        .stage(FETCH_EMAIL, stages.fetch_email, binary_edges(next(FETCH_DATABASE)))
        .stage(
            FETCH_DATABASE,
            stages.fetch_database,
            binary_edges(next(RECONCILE_DATA)),
        )
        .stage(RECONCILE_DATA, stages.reconcile_data, reconcile_edges)
        .stage(VALIDATE_DATA, stages.validate_data, binary_edges(next(PERSIST_ENTRY)))
        .stage(PERSIST_ENTRY, stages.persist_entry, binary_edges(next(FEEDBACK_CYCLE)))
        .feedback_cycle(
            FEEDBACK_CYCLE,
            FeedbackCycle::new(
                DRAFT_REPORT,
                stages.draft_report,
                EVALUATE_REPORT,
                stages.evaluate_report,
            ),
            binary_edges(next(SEND_REPORT)),
        )
        .stage(
            SEND_REPORT,
            stages.send_report,
            binary_edges(StageTarget::SuccessTerminal),
        )
        .cleanup(CLEANUP, stages.cleanup)
        .build()
}

/// Build the standard pipeline and run it once from its entry stage.
pub async fn run_standard(
    stages: StandardStages,
    config: WorkflowConfig,
    observer: Arc<dyn StageObserver>,
) -> error::Result<FinalOutcome> {
    let pipeline = standard_pipeline(stages)?;
    let executor = Executor::new(Arc::new(pipeline), config)?.with_observer(observer);
    Ok(executor.run(MODEL_CONFIG_VALIDATION).await?)
}
