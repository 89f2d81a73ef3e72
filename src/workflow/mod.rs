//! Workflow orchestration engine.
//!
//! A run flows through:
//! 1. `Pipeline` - validated stage declarations and edges
//! 2. `Executor` - invokes stages one at a time and applies transitions
//! 3. `FeedbackLoopController` - the bounded draft/evaluate cycle
//! 4. `outcome::compile` - final status and stage trace
//!
//! Every run ends with the pipeline's cleanup stage, on success and failure.

pub mod evaluation;
pub mod executor;
pub mod feedback;
pub mod observer;
pub mod outcome;
pub mod registry;
pub mod stage;
pub mod state;
pub mod transition;
pub mod types;

pub use evaluation::Evaluation;
pub use executor::Executor;
pub use feedback::{FeedbackCycle, FeedbackLoopController};
pub use observer::{
    ChannelObserver, FnObserver, NoopObserver, StageObserver, TracingObserver, TransitionEvent,
};
pub use registry::{Pipeline, PipelineBuilder, StageDefinition, StageKind};
pub use stage::{FnStage, StageOperation, stage_fn};
pub use state::WorkflowState;
pub use transition::{TransitionEdge, binary_edges, payload_flag};
pub use types::{
    FinalOutcome, FinalStatus, Payload, StageOutcome, StageResult, StageTarget, TraceEntry,
};
