//! Event emission for pipeline and refresh lifecycles.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
