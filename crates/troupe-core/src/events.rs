//! Engine event bus.
//!
//! Components publish engine milestones on a broadcast channel so any
//! number of observers (CLI progress view, tests, future transports) can
//! follow along without being wired into the call path. Wire names are
//! stable and colon-separated: `loop:triggered`, `workflow:paused`,
//! `step:completed`, and so on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEventType {
    #[serde(rename = "loop:triggered")]
    LoopTriggered,
    #[serde(rename = "loop:resolved")]
    LoopResolved,
    #[serde(rename = "loop:escalated")]
    LoopEscalated,
    #[serde(rename = "workflow:paused")]
    WorkflowPaused,
    #[serde(rename = "workflow:resumed")]
    WorkflowResumed,
    #[serde(rename = "step:completed")]
    StepCompleted,
    #[serde(rename = "step:failed")]
    StepFailed,
}

impl EngineEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineEventType::LoopTriggered => "loop:triggered",
            EngineEventType::LoopResolved => "loop:resolved",
            EngineEventType::LoopEscalated => "loop:escalated",
            EngineEventType::WorkflowPaused => "workflow:paused",
            EngineEventType::WorkflowResumed => "workflow:resumed",
            EngineEventType::StepCompleted => "step:completed",
            EngineEventType::StepFailed => "step:failed",
        }
    }
}

impl std::fmt::Display for EngineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub event_type: EngineEventType,
    pub session_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: EngineEventType, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Cloneable handle to the broadcast channel. Emitting with no live
/// subscribers is fine; the event is simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        trace!("[Events] {} ({})", event.event_type, event.session_id);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
