//! Lifecycle event bus: trait for emitting follow-up events from any module.
//!
//! Components accept an `Arc<dyn EventSink>` and report enrollments,
//! dispatches, stage moves and responses through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::FollowUpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FollowUpEnrolled,
    StepDispatched,
    DispatchFailed,
    StageAdvanced,
    StageParked,
    FollowUpCompleted,
    FollowUpCanceled,
    FollowUpPaused,
    FollowUpResumed,
    ResponseReceived,
    ResponseDeferred,
    AdvisorOverride,
    TimerFired,
    StaleTimerDropped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub follow_up_id: FollowUpId,
    pub client_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Receives lifecycle events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FollowUpEvent);
}

/// No-op sink for deployments that don't consume events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FollowUpEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FollowUpEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<FollowUpEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FollowUpEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `FollowUpEvent`.
pub fn make_event(
    event_type: EventType,
    follow_up_id: FollowUpId,
    client_id: Option<String>,
    detail: Option<String>,
) -> FollowUpEvent {
    FollowUpEvent {
        event_id: Uuid::new_v4(),
        event_type,
        follow_up_id,
        client_id,
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let id = Uuid::new_v4();
        sink.emit(make_event(
            EventType::FollowUpEnrolled,
            id,
            Some("client-1".into()),
            None,
        ));
        sink.emit(make_event(
            EventType::StepDispatched,
            id,
            Some("client-1".into()),
            Some("step 0".into()),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::FollowUpEnrolled), 1);
        assert_eq!(sink.count_type(EventType::StepDispatched), 1);

        let events = sink.events();
        assert_eq!(events[0].follow_up_id, id);
        assert_eq!(events[1].detail, Some("step 0".into()));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EventType::TimerFired, Uuid::new_v4(), None, None));
    }
}
