//! Pipeline event sinks.
//!
//! The orchestrator reports every state transition, stage timing and run
//! outcome through an [`EventSink`]. Sinks are injected per pipeline; the
//! default discards everything.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Event type names emitted by the orchestrator.
pub mod kinds {
    /// A run was accepted and its workspace acquired.
    pub const RUN_STARTED: &str = "run.started";
    /// The run moved to a new pipeline state.
    pub const STATE_CHANGED: &str = "run.state_changed";
    /// A stage finished; carries its duration.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// The run uploaded its artifact.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// The run ended in `Failed`.
    pub const RUN_FAILED: &str = "run.failed";
    /// The workspace was removed.
    pub const WORKSPACE_RELEASED: &str = "workspace.released";
}

/// Receiver for pipeline events.
#[async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Emits an event.
    async fn emit(&self, event_type: &str, data: Option<Value>);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Sink that forwards events to `tracing`.
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
    /// Creates a logging sink. Only `DEBUG` is honoured specially; every
    /// other level logs at `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log(&self, event_type: &str, data: Option<&Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type, event_data = ?data, "pipeline event");
        } else {
            info!(event_type, event_data = ?data, "pipeline event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log(event_type, data.as_ref());
    }
}

/// Sink that keeps every event in memory. Used by tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every collected event.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the payloads of events of exactly `event_type`.
    #[must_use]
    pub fn payloads_of(&self, event_type: &str) -> Vec<Value> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .filter_map(|(_, data)| data.clone())
            .collect()
    }

    /// Returns the `to` field of every state change, in order.
    #[must_use]
    pub fn states(&self) -> Vec<String> {
        self.payloads_of(kinds::STATE_CHANGED)
            .iter()
            .filter_map(|v| v.get("to").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
