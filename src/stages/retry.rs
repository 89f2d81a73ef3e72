//! Retry strategy for external collaborator handlers.
//!
//! Retries belong to the collaborator, never to the executor: a
//! `RetryingHandler` wraps one handler and retries transient failures with
//! jittered exponential backoff before the stage sees a result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

use crate::error::HandlerError;
use crate::stages::handler::StageHandler;

/// Backoff parameters for one handler.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomised in either direction (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Exponential backoff with `max_attempts` total attempts.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Whether a handler error is worth retrying.
fn is_transient(err: &HandlerError) -> bool {
    matches!(
        err,
        HandlerError::ExecutionFailed { .. } | HandlerError::Timeout { .. } | HandlerError::Io(_)
    )
}

/// Handler decorator applying a `RetryPolicy`.
pub struct RetryingHandler {
    inner: Arc<dyn StageHandler>,
    policy: RetryPolicy,
}

impl RetryingHandler {
    pub fn new(inner: Arc<dyn StageHandler>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl StageHandler for RetryingHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, args: Value) -> Result<Value, HandlerError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.invoke(args.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if !is_transient(&e) => return Err(e),
                Err(e) if attempt >= attempts => {
                    if attempts == 1 {
                        return Err(e);
                    }
                    return Err(HandlerError::RetriesExhausted {
                        name: self.inner.name().to_string(),
                        attempts,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.policy.jittered(attempt);
                    tracing::warn!(
                        capability = %self.inner.name(),
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Handler failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
