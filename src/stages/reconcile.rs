//! Record reconciliation.
//!
//! Compares the freshly fetched record against the records already stored
//! and reports `data_exists` when one of them shares the match key. The
//! pipeline routes `data_exists == true` straight to the success terminal.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StageError;
use crate::workflow::stage::StageOperation;
use crate::workflow::state::WorkflowState;
use crate::workflow::types::StageResult;

/// Default field used to match records.
pub const DEFAULT_MATCH_KEY: &str = "date";

/// Reconciles the fetched record against stored records.
#[derive(Debug, Clone)]
pub struct RecordReconciler {
    fetched_stage: String,
    stored_stage: String,
    match_key: String,
}

impl RecordReconciler {
    /// Reconcile the payload of `fetched_stage` against the `records` array
    /// produced by `stored_stage`.
    pub fn new(fetched_stage: impl Into<String>, stored_stage: impl Into<String>) -> Self {
        Self {
            fetched_stage: fetched_stage.into(),
            stored_stage: stored_stage.into(),
            match_key: DEFAULT_MATCH_KEY.to_string(),
        }
    }

    pub fn with_match_key(mut self, key: impl Into<String>) -> Self {
        self.match_key = key.into();
        self
    }

    fn reconcile(&self, state: &WorkflowState) -> Result<StageResult, String> {
        let fetched = state
            .get(&self.fetched_stage)
            .ok_or_else(|| format!("no result from {}", self.fetched_stage))?;
        let stored = state
            .get(&self.stored_stage)
            .ok_or_else(|| format!("no result from {}", self.stored_stage))?;

        // The fetched payload may carry the record inline or under `record`.
        let record = fetched
            .payload
            .get("record")
            .and_then(Value::as_object)
            .unwrap_or(&fetched.payload);
        let value = record
            .get(&self.match_key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| format!("fetched record has no {}", self.match_key))?;

        let records = stored
            .payload
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| format!("{} returned no records array", self.stored_stage))?;

        let data_exists = records
            .iter()
            .any(|r| r.get(&self.match_key) == Some(value));

        Ok(StageResult::success()
            .with("data_exists", data_exists)
            .with("match_key", self.match_key.clone())
            .with("value", value.clone())
            .with("stored_count", records.len()))
    }
}

#[async_trait]
impl StageOperation for RecordReconciler {
    async fn execute(&self, state: &WorkflowState) -> Result<StageResult, StageError> {
        let result = self.reconcile(state).map_err(StageError::Failed)?;
        if result.flag("data_exists") {
            tracing::info!(
                key = %self.match_key,
                value = %result.payload["value"],
                "Record already stored, nothing to report"
            );
        }
        Ok(result)
    }
}
