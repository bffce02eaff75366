//! Event emission for workflow observability.

mod event;
mod sink;

pub use event::EngineEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
