//! Capability-keyed handler registry.
//!
//! External collaborators (mail fetch, database, model calls, delivery) are
//! reached through `StageHandler`s registered under a capability name. A
//! `HandlerStage` resolves its capability by lookup when the stage runs and
//! maps the handler's JSON output onto a `StageResult`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::error::{HandlerError, StageError};
use crate::workflow::stage::StageOperation;
use crate::workflow::state::WorkflowState;
use crate::workflow::types::StageResult;

/// An external collaborator reachable by capability name.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Capability name the handler is registered under.
    fn name(&self) -> &str;

    /// Invoke the collaborator with JSON arguments.
    async fn invoke(&self, args: Value) -> Result<Value, HandlerError>;
}

/// Registry of available handlers.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn StageHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for the same capability.
    pub async fn register(&self, handler: Arc<dyn StageHandler>) {
        let name = handler.name().to_string();
        let replaced = self
            .handlers
            .write()
            .await
            .insert(name.clone(), handler)
            .is_some();
        if replaced {
            tracing::warn!(capability = %name, "Replaced existing handler");
        } else {
            tracing::debug!("Registered handler: {}", name);
        }
    }

    /// Remove a handler.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.write().await.remove(name)
    }

    /// Get a handler by capability name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    /// Check if a capability is registered.
    pub async fn has(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// List all capability names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve and invoke a capability.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, HandlerError> {
        let handler = self
            .get(name)
            .await
            .ok_or_else(|| HandlerError::NotFound(name.to_string()))?;
        handler.invoke(args).await
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage operation that delegates to a registered capability.
pub struct HandlerStage {
    registry: Arc<HandlerRegistry>,
    capability: String,
}

impl HandlerStage {
    pub fn new(registry: Arc<HandlerRegistry>, capability: impl Into<String>) -> Self {
        Self {
            registry,
            capability: capability.into(),
        }
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }
}

#[async_trait]
impl StageOperation for HandlerStage {
    async fn execute(&self, state: &WorkflowState) -> Result<StageResult, StageError> {
        let output = self
            .registry
            .invoke(&self.capability, handler_args(state))
            .await?;
        Ok(output_to_result(&self.capability, output)?)
    }
}

/// Arguments handed to every handler: run bookkeeping plus prior payloads.
pub fn handler_args(state: &WorkflowState) -> Value {
    let results: serde_json::Map<String, Value> = state
        .results()
        .iter()
        .map(|(stage, result)| (stage.clone(), Value::Object(result.payload.clone())))
        .collect();
    json!({
        "run_id": state.run_id().to_string(),
        "iteration": state.iteration_count(),
        "max_iterations": state.max_iterations(),
        "feedback": state.feedback(),
        "results": results,
    })
}

/// Map handler output onto a stage result.
///
/// Objects with `"success": false` become failures carrying `"error"`; any
/// other object is a success payload. Non-object output is invalid.
pub fn output_to_result(capability: &str, output: Value) -> Result<StageResult, HandlerError> {
    let Value::Object(mut payload) = output else {
        return Err(HandlerError::InvalidOutput {
            name: capability.to_string(),
            reason: "expected a JSON object".to_string(),
        });
    };

    let succeeded = payload
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    if succeeded {
        return Ok(StageResult::success().with_payload(payload));
    }

    let error = payload
        .remove("error")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{capability} reported failure"));
    Ok(StageResult::failure(error).with_payload(payload))
}
