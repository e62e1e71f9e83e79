use std::sync::Mutex;

use async_trait::async_trait;
use seedling_core::{Kind, ManagedResource, ObjectKey};
use tracing::warn;

use crate::EventRecorder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: Kind,
    pub key: ObjectKey,
    pub reason: String,
    pub message: String,
}

/// Keeps warning events in memory and logs them.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn warning(&self, obj: &ManagedResource, reason: &str, message: &str) {
        warn!(kind = %obj.kind, key = %obj.key(), reason, message, "event: warning");
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent { kind: obj.kind, key: obj.key(), reason: reason.to_string(), message: message.to_string() });
        }
    }
}
