//! Model configuration check.
//!
//! First stage of the reporting pipeline: every stage that calls a model must
//! have an assignment, and every assignment must name an allowed model.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::WorkflowConfig;
use crate::error::StageError;
use crate::workflow::stage::StageOperation;
use crate::workflow::state::WorkflowState;
use crate::workflow::types::StageResult;

/// Validates model assignments from the injected configuration.
#[derive(Debug, Clone)]
pub struct ModelAssignmentCheck {
    required: Vec<String>,
    config: WorkflowConfig,
}

impl ModelAssignmentCheck {
    pub fn new<I, S>(required: I, config: WorkflowConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            config,
        }
    }

    fn check(&self) -> StageResult {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|stage| self.config.model_for(stage).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return StageResult::failure(format!(
                "Missing model assignments for stages: {}",
                missing.join(", ")
            ))
            .with("missing", json!(missing));
        }

        if !self.config.allowed_models.is_empty() {
            let invalid: Vec<String> = self
                .config
                .model_assignments
                .iter()
                .filter(|(_, model)| !self.config.allowed_models.contains(model))
                .map(|(stage, model)| format!("{stage}: {model}"))
                .collect();
            if !invalid.is_empty() {
                return StageResult::failure(format!(
                    "Invalid model assignments: {}",
                    invalid.join(", ")
                ))
                .with("invalid", json!(invalid));
            }
        }

        let assignments: serde_json::Map<String, Value> = self
            .config
            .model_assignments
            .iter()
            .map(|(stage, model)| (stage.clone(), Value::String(model.clone())))
            .collect();
        StageResult::success().with("assignments", Value::Object(assignments))
    }
}

#[async_trait]
impl StageOperation for ModelAssignmentCheck {
    async fn execute(&self, _state: &WorkflowState) -> Result<StageResult, StageError> {
        let result = self.check();
        if let Some(error) = &result.error {
            tracing::warn!("Model configuration check failed: {}", error);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(assignments: &[(&str, &str)], allowed: &[&str]) -> WorkflowConfig {
        WorkflowConfig {
            model_assignments: assignments
                .iter()
                .map(|(s, m)| (s.to_string(), m.to_string()))
                .collect(),
            allowed_models: allowed.iter().map(|s| s.to_string()).collect(),
            ..WorkflowConfig::default()
        }
    }

    #[tokio::test]
    async fn passes_when_all_assigned() {
        let check = ModelAssignmentCheck::new(
            ["draft_report", "evaluate_report"],
            config(
                &[("draft_report", "model-a"), ("evaluate_report", "model-b")],
                &["model-a", "model-b"],
            ),
        );
        let result = check.execute(&WorkflowState::initialize(3)).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.payload["assignments"]["draft_report"], "model-a");
    }

    #[tokio::test]
    async fn reports_missing_assignments() {
        let check = ModelAssignmentCheck::new(
            ["draft_report", "evaluate_report"],
            config(&[("draft_report", "model-a")], &[]),
        );
        let result = check.execute(&WorkflowState::initialize(3)).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("evaluate_report"));
    }

    #[tokio::test]
    async fn reports_disallowed_models() {
        let check = ModelAssignmentCheck::new(
            ["draft_report"],
            config(&[("draft_report", "model-z")], &["model-a"]),
        );
        let result = check.execute(&WorkflowState::initialize(3)).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("draft_report: model-z"));
    }

    #[tokio::test]
    async fn empty_allow_list_accepts_any_model() {
        let check = ModelAssignmentCheck::new(
            ["draft_report"],
            config(&[("draft_report", "anything")], &[]),
        );
        let result = check.execute(&WorkflowState::initialize(3)).await.unwrap();
        assert!(result.is_success());
    }
}
