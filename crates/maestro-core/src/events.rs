//! Event bus for instance lifecycle notifications.
//!
//! A thin wrapper over a tokio broadcast channel. The workflow engine
//! subscribes so an instance terminated mid-stage interrupts any in-flight
//! trigger wait; embedders can subscribe for observability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEventType {
    InstanceCreated,
    InstanceActivated,
    InstanceTerminated,
    InstanceFailed,
    StageEntered,
    RunFinished,
}

impl InstanceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceCreated => "INSTANCE_CREATED",
            Self::InstanceActivated => "INSTANCE_ACTIVATED",
            Self::InstanceTerminated => "INSTANCE_TERMINATED",
            Self::InstanceFailed => "INSTANCE_FAILED",
            Self::StageEntered => "STAGE_ENTERED",
            Self::RunFinished => "RUN_FINISHED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEvent {
    #[serde(rename = "type")]
    pub event_type: InstanceEventType,
    pub instance_id: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl InstanceEvent {
    pub fn new(event_type: InstanceEventType, instance_id: &str, data: serde_json::Value) -> Self {
        Self {
            event_type,
            instance_id: instance_id.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InstanceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: InstanceEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
