//! Engine lifecycle events.
//!
//! The event set is closed and typed: every observable side effect of a
//! run besides its returned result is one of the [`EngineEvent`]
//! variants. Events are pushed synchronously on the emitting task;
//! sinks must not block.

use crate::verification::VerificationReport;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// A single engine lifecycle event.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A stage has started executing.
    StageStart {
        /// The stage name.
        name: String,
        /// The resolved model id the stage will use.
        model: String,
        /// 1-based position of this stage in the run.
        index: usize,
        /// Total number of stages in the run.
        total: usize,
    },
    /// A chunk of streamed stage output.
    StageStream {
        /// The stage name.
        name: String,
        /// The text chunk.
        chunk: String,
    },
    /// A stage completed successfully.
    StageComplete {
        /// The stage name.
        name: String,
        /// Actual cost of the stage in USD.
        cost_usd: f64,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },
    /// A stage failed.
    StageError {
        /// The stage name.
        name: String,
    },
    /// A declared tool group could not be resolved.
    ToolUnavailable {
        /// The tool-group name.
        name: String,
        /// Whether the group was required.
        required: bool,
    },
    /// Claim verification finished for a verify stage.
    VerificationComplete {
        /// The verify stage name.
        name: String,
    },
    /// The run settled.
    PipelineComplete {
        /// Total spend across all stages in USD.
        total_cost_usd: f64,
        /// True if any stage failed, was skipped, or the run was
        /// cancelled before full completion.
        partial: bool,
        /// Claim verification report, when a verify stage completed.
        report: Option<VerificationReport>,
    },
}

impl EngineEvent {
    /// Returns the stage name carried by this event, if any.
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::StageStart { name, .. }
            | Self::StageStream { name, .. }
            | Self::StageComplete { name, .. }
            | Self::StageError { name }
            | Self::VerificationComplete { name } => Some(name),
            Self::ToolUnavailable { .. } | Self::PipelineComplete { .. } => None,
        }
    }
}

/// Trait for event subscribers.
///
/// `on_event` is called on the emitting task and must return promptly;
/// a slow subscriber would stall the engine.
pub trait EventSink: Send + Sync {
    /// Receives one event.
    fn on_event(&self, event: &EngineEvent);
}

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out registry for event sinks.
///
/// Cloning the bus is cheap; all clones share the subscriber set.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<RwLock<HashMap<u64, Arc<dyn EventSink>>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sinks.read().len())
            .finish()
    }
}

impl EventBus {
    /// Creates a new bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink and returns its subscription handle.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.write().insert(id, sink);
        SubscriptionId(id)
    }

    /// Removes a previously registered sink. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.sinks.write().remove(&id.0);
    }

    /// Returns the number of registered sinks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Pushes an event to every subscriber on the calling task.
    ///
    /// The subscriber set is snapshotted before dispatch, so a sink may
    /// subscribe or unsubscribe from inside `on_event`.
    pub fn emit(&self, event: &EngineEvent) {
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().values().cloned().collect();
        for sink in sinks {
            sink.on_event(event);
        }
    }
}

/// A sink that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn on_event(&self, event: &EngineEvent) {
        info!(event = ?event, "engine event");
    }
}

/// A sink that records every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: parking_lot::Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    /// Creates a new empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Returns recorded events for a single stage, in order.
    #[must_use]
    pub fn stage_events(&self, stage: &str) -> Vec<EngineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.stage_name() == Some(stage))
            .cloned()
            .collect()
    }

    /// Clears the recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_event(name: &str) -> EngineEvent {
        EngineEvent::StageStart {
            name: name.to_string(),
            model: "test-model".to_string(),
            index: 1,
            total: 1,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = EventBus::new();
        let sink = Arc::new(CollectingSink::new());
        bus.subscribe(sink.clone());

        bus.emit(&start_event("gather"));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage_name(), Some("gather"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let sink = Arc::new(CollectingSink::new());
        let id = bus.subscribe(sink.clone());

        bus.emit(&start_event("a"));
        bus.unsubscribe(id);
        bus.emit(&start_event("b"));

        assert_eq!(sink.events().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let sink = Arc::new(CollectingSink::new());
        bus.subscribe(sink.clone());

        clone.emit(&EngineEvent::PipelineComplete {
            total_cost_usd: 0.5,
            partial: false,
            report: None,
        });

        assert_eq!(sink.events().len(), 1);
    }

    struct SelfRemovingSink {
        bus: EventBus,
        id: parking_lot::Mutex<Option<SubscriptionId>>,
        seen: std::sync::atomic::AtomicUsize,
    }

    impl EventSink for SelfRemovingSink {
        fn on_event(&self, _event: &EngineEvent) {
            self.seen.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = self.id.lock().take() {
                self.bus.unsubscribe(id);
            }
        }
    }

    #[test]
    fn test_sink_may_unsubscribe_during_dispatch() {
        let bus = EventBus::new();
        let sink = Arc::new(SelfRemovingSink {
            bus: bus.clone(),
            id: parking_lot::Mutex::new(None),
            seen: std::sync::atomic::AtomicUsize::new(0),
        });
        let id = bus.subscribe(sink.clone());
        *sink.id.lock() = Some(id);

        bus.emit(&start_event("a"));
        bus.emit(&start_event("b"));

        assert_eq!(sink.seen.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_stage_events_filter() {
        let sink = CollectingSink::new();
        sink.on_event(&start_event("a"));
        sink.on_event(&start_event("b"));
        sink.on_event(&EngineEvent::StageError {
            name: "a".to_string(),
        });

        assert_eq!(sink.stage_events("a").len(), 2);
        assert_eq!(sink.stage_events("b").len(), 1);
    }
}
