//! Event sink trait and implementations.

use super::EngineEvent;
use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Receives [`EngineEvent`]s as workflows progress.
///
/// The engine emits one event per committed transition through a sink
/// so hosts can wire up alerting or audit feeds without the engine
/// knowing about them.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event asynchronously.
    async fn emit(&self, event: EngineEvent);

    /// Delivers an event without awaiting.
    ///
    /// Used on paths that cannot await the sink; delivery failures are
    /// swallowed, never surfaced to the workflow.
    fn try_emit(&self, event: EngineEvent);
}

/// Discards all events. The default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: EngineEvent) {}

    fn try_emit(&self, _event: EngineEvent) {}
}

/// Forwards events to the `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &EngineEvent) {
        if self.level == Level::DEBUG {
            debug!(kind = event.kind(), payload = ?event, "engine event");
        } else {
            info!(kind = event.kind(), payload = ?event, "engine event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: EngineEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: EngineEvent) {
        self.log_event(&event);
    }
}

/// Collects events in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<EngineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose kind starts with the given prefix.
    #[must_use]
    pub fn of_kind(&self, kind_prefix: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.kind().starts_with(kind_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: EngineEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: EngineEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_uuid;

    fn started() -> EngineEvent {
        EngineEvent::WorkflowStarted {
            workflow_id: generate_uuid(),
        }
    }

    #[tokio::test]
    async fn test_noop_sink_discards() {
        let sink = NoOpEventSink;
        sink.emit(started()).await;
        sink.try_emit(started());
    }

    #[tokio::test]
    async fn test_logging_sink_does_not_panic() {
        let sink = LoggingEventSink::default();
        sink.emit(started()).await;
        LoggingEventSink::debug().try_emit(started());
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_kind() {
        let sink = CollectingEventSink::new();
        let id = generate_uuid();
        sink.emit(EngineEvent::StageApplied {
            workflow_id: id,
            stage: 0,
            percent: 10,
        })
        .await;
        sink.emit(EngineEvent::StagePassed {
            workflow_id: id,
            next_stage: 1,
            score: 92.0,
        })
        .await;
        sink.emit(EngineEvent::WorkflowSucceeded { workflow_id: id })
            .await;

        assert_eq!(sink.of_kind("stage.").len(), 2);
        assert_eq!(sink.of_kind("workflow.succeeded").len(), 1);
        assert!(sink.of_kind("regression.").is_empty());

        sink.clear();
        assert!(sink.is_empty());
    }
}
