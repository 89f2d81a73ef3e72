//! Stage registry.
//!
//! A `Pipeline` is the static declaration of a workflow: named stages with
//! their operations and outgoing edges, at most one feedback cycle, and the
//! mandatory cleanup tail. `PipelineBuilder::build` validates the whole
//! declaration up front so that no run can start against a broken graph.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::ConfigError;
use crate::workflow::feedback::FeedbackCycle;
use crate::workflow::stage::StageOperation;
use crate::workflow::state::WorkflowState;
use crate::workflow::transition::{TransitionEdge, select_target};
use crate::workflow::types::{StageOutcome, StageResult, StageTarget};

/// What runs when a stage is entered.
#[derive(Clone)]
pub enum StageKind {
    Operation(Arc<dyn StageOperation>),
    /// Composite draft/evaluate stage driven by the feedback-loop controller.
    FeedbackCycle(FeedbackCycle),
}

/// A registered stage.
#[derive(Clone)]
pub struct StageDefinition {
    name: String,
    kind: StageKind,
    edges: Vec<TransitionEdge>,
}

impl StageDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn edges(&self) -> &[TransitionEdge] {
        &self.edges
    }

    fn successors(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().filter_map(|e| match e.target() {
            StageTarget::Stage(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            StageKind::Operation(_) => "operation".to_string(),
            StageKind::FeedbackCycle(cycle) => format!("{cycle:?}"),
        };
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("edges", &self.edges)
            .finish()
    }
}

/// The tail stage that runs once after a terminal is reached.
#[derive(Clone)]
pub struct CleanupStage {
    name: String,
    op: Arc<dyn StageOperation>,
}

impl CleanupStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> &dyn StageOperation {
        self.op.as_ref()
    }
}

/// A validated pipeline declaration.
pub struct Pipeline {
    stages: HashMap<String, StageDefinition>,
    order: Vec<String>,
    cleanup: CleanupStage,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.get(name)
    }

    /// Stage names in registration order; the first is the entry stage.
    pub fn stage_names(&self) -> &[String] {
        &self.order
    }

    pub fn entry(&self) -> &str {
        &self.order[0]
    }

    pub fn cleanup(&self) -> &CleanupStage {
        &self.cleanup
    }

    /// Names of the draft/evaluate stages inside feedback cycles.
    pub fn cycle_stage_names(&self) -> Vec<String> {
        self.stages
            .values()
            .filter_map(|def| match &def.kind {
                StageKind::FeedbackCycle(cycle) => Some([
                    cycle.draft_name().to_string(),
                    cycle.evaluate_name().to_string(),
                ]),
                StageKind::Operation(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Decide where a run goes after `stage` produced `result`.
    ///
    /// Pure: the same stage, result and state always give the same target.
    pub fn transition(
        &self,
        stage: &str,
        result: &StageResult,
        state: &WorkflowState,
    ) -> Result<StageTarget, ConfigError> {
        let definition = self
            .stages
            .get(stage)
            .ok_or_else(|| ConfigError::UnknownStage(stage.to_string()))?;
        Ok(select_target(stage, &definition.edges, result, state))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("order", &self.order)
            .field("cleanup", &self.cleanup.name)
            .finish()
    }
}

/// Builder collecting stage declarations before validation.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<StageDefinition>,
    cleanup: Option<CleanupStage>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation stage with its outgoing edges.
    pub fn stage(
        mut self,
        name: impl Into<String>,
        op: Arc<dyn StageOperation>,
        edges: Vec<TransitionEdge>,
    ) -> Self {
        self.stages.push(StageDefinition {
            name: name.into(),
            kind: StageKind::Operation(op),
            edges,
        });
        self
    }

    /// Register the composite feedback-cycle stage.
    pub fn feedback_cycle(
        mut self,
        name: impl Into<String>,
        cycle: FeedbackCycle,
        edges: Vec<TransitionEdge>,
    ) -> Self {
        self.stages.push(StageDefinition {
            name: name.into(),
            kind: StageKind::FeedbackCycle(cycle),
            edges,
        });
        self
    }

    /// Register the mandatory tail stage.
    pub fn cleanup(mut self, name: impl Into<String>, op: Arc<dyn StageOperation>) -> Self {
        self.cleanup = Some(CleanupStage {
            name: name.into(),
            op,
        });
        self
    }

    /// Validate and freeze the declaration.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyPipeline);
        }
        let cleanup = self.cleanup.ok_or(ConfigError::MissingCleanup)?;

        let mut names: HashSet<String> = HashSet::new();
        names.insert(cleanup.name.clone());
        let mut cycles = 0usize;
        for def in &self.stages {
            claim(&mut names, &def.name)?;
            if let StageKind::FeedbackCycle(cycle) = &def.kind {
                cycles += 1;
                claim(&mut names, cycle.draft_name())?;
                claim(&mut names, cycle.evaluate_name())?;
            }
        }
        if cycles > 1 {
            return Err(ConfigError::InvalidValue {
                key: "feedback_cycle".to_string(),
                message: format!("{cycles} feedback cycles registered, at most one allowed"),
            });
        }

        let order: Vec<String> = self.stages.iter().map(|d| d.name.clone()).collect();
        let stages: HashMap<String, StageDefinition> = self
            .stages
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        for name in &order {
            let def = &stages[name];
            for outcome in [StageOutcome::Success, StageOutcome::Failure] {
                let covered = def
                    .edges
                    .iter()
                    .any(|e| e.outcome() == outcome && e.is_unconditional());
                if !covered {
                    return Err(ConfigError::MissingEdge {
                        stage: name.clone(),
                        outcome,
                    });
                }
            }
            for target in def.successors() {
                if !stages.contains_key(target) {
                    return Err(ConfigError::UnknownTarget {
                        stage: name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        check_acyclic(&order, &stages)?;

        debug!(stages = order.len(), cleanup = %cleanup.name, "Pipeline registered");
        Ok(Pipeline {
            stages,
            order,
            cleanup,
        })
    }
}

fn claim(names: &mut HashSet<String>, name: &str) -> Result<(), ConfigError> {
    if !names.insert(name.to_string()) {
        return Err(ConfigError::DuplicateStage(name.to_string()));
    }
    Ok(())
}

/// Reject cycles in the outer stage graph. The only loop a run may take is
/// the bounded one inside the feedback-cycle stage.
fn check_acyclic(
    order: &[String],
    stages: &HashMap<String, StageDefinition>,
) -> Result<(), ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        stages: &'a HashMap<String, StageDefinition>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), ConfigError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(ConfigError::Cycle {
                    stage: name.to_string(),
                });
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        for next in stages[name].successors() {
            visit(next, stages, marks)?;
        }
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for name in order {
        visit(name, stages, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::stage::stage_fn;
    use crate::workflow::transition::binary_edges;

    fn ok() -> Arc<dyn StageOperation> {
        stage_fn(|_| Ok(StageResult::success()))
    }

    #[test]
    fn builds_linear_pipeline() {
        let pipeline = Pipeline::builder()
            .stage("a", ok(), binary_edges(StageTarget::stage("b")))
            .stage("b", ok(), binary_edges(StageTarget::SuccessTerminal))
            .cleanup("cleanup", ok())
            .build()
            .unwrap();
        assert_eq!(pipeline.entry(), "a");
        assert_eq!(pipeline.stage_names(), ["a", "b"]);
        assert_eq!(pipeline.cleanup().name(), "cleanup");
    }

    #[test]
    fn missing_failure_edge_is_rejected() {
        let err = Pipeline::builder()
            .stage(
                "a",
                ok(),
                vec![TransitionEdge::on_success(StageTarget::SuccessTerminal)],
            )
            .cleanup("cleanup", ok())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEdge { ref stage, outcome: StageOutcome::Failure } if stage == "a"
        ));
    }

    #[test]
    fn missing_success_edge_is_rejected() {
        let err = Pipeline::builder()
            .stage(
                "a",
                ok(),
                vec![TransitionEdge::on_failure(StageTarget::FailureTerminal)],
            )
            .cleanup("cleanup", ok())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEdge { outcome: StageOutcome::Success, .. }
        ));
    }

    #[test]
    fn conditional_only_edge_does_not_count() {
        let err = Pipeline::builder()
            .stage(
                "a",
                ok(),
                vec![
                    TransitionEdge::when(
                        StageOutcome::Success,
                        "exists",
                        |r: &StageResult, _: &WorkflowState| r.flag("x"),
                        StageTarget::SuccessTerminal,
                    ),
                    TransitionEdge::on_failure(StageTarget::FailureTerminal),
                ],
            )
            .cleanup("cleanup", ok())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEdge { .. }));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = Pipeline::builder()
            .stage("a", ok(), binary_edges(StageTarget::stage("ghost")))
            .cleanup("cleanup", ok())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTarget { ref target, .. } if target == "ghost"));
    }

    #[test]
    fn cleanup_is_not_a_routable_target() {
        let err = Pipeline::builder()
            .stage("a", ok(), binary_edges(StageTarget::stage("cleanup")))
            .cleanup("cleanup", ok())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTarget { .. }));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Pipeline::builder()
            .stage("a", ok(), binary_edges(StageTarget::SuccessTerminal))
            .stage("a", ok(), binary_edges(StageTarget::SuccessTerminal))
            .cleanup("cleanup", ok())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStage(ref s) if s == "a"));
    }

    #[test]
    fn cycles_are_rejected() {
        let err = Pipeline::builder()
            .stage("a", ok(), binary_edges(StageTarget::stage("b")))
            .stage("b", ok(), binary_edges(StageTarget::stage("a")))
            .cleanup("cleanup", ok())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Cycle { .. }));
    }

    #[test]
    fn cleanup_and_stages_are_required() {
        assert!(matches!(
            Pipeline::builder().cleanup("cleanup", ok()).build().unwrap_err(),
            ConfigError::EmptyPipeline
        ));
        assert!(matches!(
            Pipeline::builder()
                .stage("a", ok(), binary_edges(StageTarget::SuccessTerminal))
                .build()
                .unwrap_err(),
            ConfigError::MissingCleanup
        ));
    }

    #[test]
    fn cycle_stage_names_are_exposed() {
        let cycle = FeedbackCycle::new("draft", ok(), "evaluate", ok());
        let pipeline = Pipeline::builder()
            .feedback_cycle("loop", cycle, binary_edges(StageTarget::SuccessTerminal))
            .cleanup("cleanup", ok())
            .build()
            .unwrap();
        let mut names = pipeline.cycle_stage_names();
        names.sort();
        assert_eq!(names, ["draft", "evaluate"]);
    }

    #[test]
    fn transition_on_unknown_stage_errors() {
        let pipeline = Pipeline::builder()
            .stage("a", ok(), binary_edges(StageTarget::SuccessTerminal))
            .cleanup("cleanup", ok())
            .build()
            .unwrap();
        let state = WorkflowState::initialize(3);
        assert!(pipeline
            .transition("nope", &StageResult::success(), &state)
            .is_err());
        assert_eq!(
            pipeline
                .transition("a", &StageResult::success(), &state)
                .unwrap(),
            StageTarget::SuccessTerminal
        );
    }
}
