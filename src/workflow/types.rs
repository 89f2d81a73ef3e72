//! Shared types for the workflow engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload carried by a stage result.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ── Stage outcome ───────────────────────────────────────────────────

/// Binary outcome of a stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failure,
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

// ── Stage result ────────────────────────────────────────────────────

/// The fragment a stage contributes to the workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageOutcome,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    /// A successful result with an empty payload.
    pub fn success() -> Self {
        Self {
            status: StageOutcome::Success,
            payload: Payload::new(),
            error: None,
        }
    }

    /// A failed result carrying an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: StageOutcome::Failure,
            payload: Payload::new(),
            error: Some(error.into()),
        }
    }

    /// Attach a payload field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replace the whole payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Read a boolean payload flag; missing or non-boolean values are `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

// ── Transition targets ──────────────────────────────────────────────

/// Where a transition leads: another stage or one of the two terminals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "stage", rename_all = "snake_case")]
pub enum StageTarget {
    Stage(String),
    SuccessTerminal,
    FailureTerminal,
}

impl StageTarget {
    pub fn stage(name: impl Into<String>) -> Self {
        Self::Stage(name.into())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Stage(_))
    }
}

impl fmt::Display for StageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(name) => write!(f, "{name}"),
            Self::SuccessTerminal => write!(f, "SUCCESS_TERMINAL"),
            Self::FailureTerminal => write!(f, "FAILURE_TERMINAL"),
        }
    }
}

// ── Final status ────────────────────────────────────────────────────

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    /// Success reached by exhausting the iteration budget without approval.
    ForcedApproval,
    Failure,
}

impl FinalStatus {
    /// Forced approval counts as success for everything downstream.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure)
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::ForcedApproval => "forced_approval",
            Self::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

// ── Trace ───────────────────────────────────────────────────────────

/// One entry of the stage trace: a single stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub stage: String,
    pub status: StageOutcome,
    /// Feedback-cycle iteration at the time of the invocation (0 before the cycle).
    pub iteration: u32,
    /// Evaluator verdict, set only for evaluation steps of the feedback cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Compiled outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalOutcome {
    pub run_id: uuid::Uuid,
    pub final_status: FinalStatus,
    pub iterations_used: u32,
    pub stage_trace: Vec<TraceEntry>,
    /// Message of the first failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FinalOutcome {
    /// Stage names in invocation order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stage_trace.iter().map(|e| e.stage.as_str()).collect()
    }

    /// Number of times `stage` appears in the trace.
    pub fn invocations_of(&self, stage: &str) -> usize {
        self.stage_trace.iter().filter(|e| e.stage == stage).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_result_carries_error() {
        let result = StageResult::failure("mailbox unreachable");
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("mailbox unreachable"));
        assert!(result.payload.is_empty());
    }

    #[test]
    fn flag_reads_booleans_only() {
        let result = StageResult::success()
            .with("data_exists", true)
            .with("count", 3);
        assert!(result.flag("data_exists"));
        assert!(!result.flag("count"));
        assert!(!result.flag("missing"));
    }

    #[test]
    fn target_display_uses_terminal_markers() {
        assert_eq!(StageTarget::SuccessTerminal.to_string(), "SUCCESS_TERMINAL");
        assert_eq!(StageTarget::FailureTerminal.to_string(), "FAILURE_TERMINAL");
        assert_eq!(StageTarget::stage("cleanup").to_string(), "cleanup");
        assert!(!StageTarget::stage("cleanup").is_terminal());
    }

    #[test]
    fn forced_approval_counts_as_success() {
        assert!(FinalStatus::ForcedApproval.is_success());
        assert!(FinalStatus::Success.is_success());
        assert!(!FinalStatus::Failure.is_success());
    }

    #[test]
    fn stage_result_serialization_omits_missing_error() {
        let json = serde_json::to_value(StageResult::success().with("rows", 2)).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["payload"]["rows"], 2);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn final_status_serializes_snake_case() {
        let json = serde_json::to_value(FinalStatus::ForcedApproval).unwrap();
        assert_eq!(json, "forced_approval");
    }
}
