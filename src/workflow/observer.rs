//! Stage transition observers.
//!
//! Observers are notified once per stage invocation, synchronously on the
//! executor's task. Only `ChannelObserver` hands events off to another task;
//! every other observer runs inline and delays the next stage for as long as
//! it takes. Anything slow (network, disk, locks held elsewhere) belongs
//! behind a `ChannelObserver` with a consumer task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::workflow::types::StageOutcome;

/// What an observer is told about a stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub run_id: Uuid,
    pub stage: String,
    pub status: StageOutcome,
    pub iteration_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Receives stage transition events for logging or notification.
///
/// `on_stage` is called inline between stages and must return promptly.
/// Panics are contained and logged, but a blocking call stalls the run.
pub trait StageObserver: Send + Sync {
    fn on_stage(&self, event: &TransitionEvent);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn on_stage(&self, _event: &TransitionEvent) {}
}

/// Observer that writes each event to the tracing log.
///
/// Runs inline; it is only as fast as the installed subscriber's writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StageObserver for TracingObserver {
    fn on_stage(&self, event: &TransitionEvent) {
        tracing::info!(
            run_id = %event.run_id,
            stage = %event.stage,
            status = %event.status,
            iteration = event.iteration_count,
            "Stage finished"
        );
    }
}

/// Observer forwarding events into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<TransitionEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<TransitionEvent>) -> Self {
        Self { tx }
    }

    /// Create an observer and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransitionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StageObserver for ChannelObserver {
    fn on_stage(&self, event: &TransitionEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            tracing::debug!(stage = %event.stage, "Dropped transition event: {}", e);
        }
    }
}

/// Observer backed by a closure.
///
/// The closure runs on the executor's task and must not block or await.
pub struct FnObserver<F> {
    f: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&TransitionEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> StageObserver for FnObserver<F>
where
    F: Fn(&TransitionEvent) + Send + Sync,
{
    fn on_stage(&self, event: &TransitionEvent) {
        (self.f)(event)
    }
}

/// Notify an observer, containing any panic it raises.
pub(crate) fn notify(observer: &dyn StageObserver, event: TransitionEvent) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        observer.on_stage(&event);
    }));
    if outcome.is_err() {
        tracing::warn!(stage = %event.stage, "Stage observer panicked");
    }
}
