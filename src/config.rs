//! Configuration types.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::stages::retry::RetryPolicy;

/// Default feedback-cycle budget.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Workflow configuration, injected at executor construction.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Maximum draft/evaluate iterations per run (must be >= 1).
    pub max_iterations: u32,
    /// Which model backs which stage.
    pub model_assignments: BTreeMap<String, String>,
    /// Models a stage may be assigned to.
    pub allowed_models: Vec<String>,
    /// Timeout applied by external collaborator handlers.
    pub handler_timeout: Duration,
    /// Retry strategy wrapped around external collaborator handlers.
    pub retry: RetryPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            model_assignments: BTreeMap::new(),
            allowed_models: Vec::new(),
            handler_timeout: Duration::from_secs(300), // 5 minutes
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkflowConfig {
    /// Build config from `REPORT_FLOW_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but malformed ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("REPORT_FLOW_MAX_ITERATIONS") {
            config.max_iterations = parse_number("REPORT_FLOW_MAX_ITERATIONS", &raw)?;
        }

        if let Some(raw) = lookup("REPORT_FLOW_MODEL_ASSIGNMENTS") {
            config.model_assignments = parse_assignments(&raw)?;
        }

        if let Some(raw) = lookup("REPORT_FLOW_ALLOWED_MODELS") {
            config.allowed_models = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(raw) = lookup("REPORT_FLOW_HANDLER_TIMEOUT_SECS") {
            let secs: u64 = parse_number("REPORT_FLOW_HANDLER_TIMEOUT_SECS", &raw)?;
            config.handler_timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup("REPORT_FLOW_RETRY_ATTEMPTS") {
            config.retry.max_attempts = parse_number("REPORT_FLOW_RETRY_ATTEMPTS", &raw)?;
        }

        if let Some(raw) = lookup("REPORT_FLOW_RETRY_BASE_DELAY_MS") {
            let ms: u64 = parse_number("REPORT_FLOW_RETRY_BASE_DELAY_MS", &raw)?;
            config.retry.base_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the executor relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations < 1 {
            return Err(ConfigError::InvalidValue {
                key: "max_iterations".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Model assigned to a stage, if any.
    pub fn model_for(&self, stage: &str) -> Option<&str> {
        self.model_assignments.get(stage).map(String::as_str)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

/// Parse `stage=model,stage=model` pairs.
fn parse_assignments(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut assignments = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (stage, model) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "REPORT_FLOW_MODEL_ASSIGNMENTS".to_string(),
            message: format!("expected stage=model, got '{pair}'"),
        })?;
        assignments.insert(stage.trim().to_string(), model.trim().to_string());
    }
    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = WorkflowConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_iterations, 3);
        assert!(config.model_assignments.is_empty());
    }

    #[test]
    fn reads_values() {
        let config = WorkflowConfig::from_lookup(lookup(&[
            ("REPORT_FLOW_MAX_ITERATIONS", "5"),
            (
                "REPORT_FLOW_MODEL_ASSIGNMENTS",
                "draft_report=claude-sonnet, evaluate_report=gpt-4o",
            ),
            ("REPORT_FLOW_ALLOWED_MODELS", "claude-sonnet, gpt-4o"),
            ("REPORT_FLOW_HANDLER_TIMEOUT_SECS", "30"),
            ("REPORT_FLOW_RETRY_ATTEMPTS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.model_for("draft_report"), Some("claude-sonnet"));
        assert_eq!(config.model_for("evaluate_report"), Some("gpt-4o"));
        assert_eq!(config.allowed_models, ["claude-sonnet", "gpt-4o"]);
        assert_eq!(config.handler_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn zero_iterations_rejected() {
        let err = WorkflowConfig::from_lookup(lookup(&[("REPORT_FLOW_MAX_ITERATIONS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "max_iterations"));
    }

    #[test]
    fn malformed_number_rejected() {
        let err = WorkflowConfig::from_lookup(lookup(&[("REPORT_FLOW_MAX_ITERATIONS", "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn malformed_assignment_rejected() {
        let err = WorkflowConfig::from_lookup(lookup(&[(
            "REPORT_FLOW_MODEL_ASSIGNMENTS",
            "draft_report",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
