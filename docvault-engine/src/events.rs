//! Lifecycle events for backup and restore runs.
//!
//! Events are broadcast to any number of subscribers (the CLI event
//! logger, tests). Sending never blocks; a slow subscriber misses events
//! instead of stalling a run.

use crate::source::CollectionRef;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum VaultEvent {
    #[serde(rename = "backup:started")]
    BackupStarted { databases: Vec<String>, resumed: bool },

    #[serde(rename = "collection:started")]
    CollectionStarted { collection: CollectionRef },

    #[serde(rename = "collection:chunk")]
    ChunkFlushed {
        collection: CollectionRef,
        file: String,
        doc_count: u64,
        bytes: u64,
    },

    #[serde(rename = "collection:committed")]
    CollectionCommitted {
        collection: CollectionRef,
        doc_count: u64,
        /// Committed by an earlier attempt of the same backup.
        resumed: bool,
    },

    #[serde(rename = "collection:failed")]
    CollectionFailed { collection: CollectionRef, error: String },

    #[serde(rename = "collection:skipped")]
    CollectionSkipped { collection: CollectionRef },

    #[serde(rename = "restore:started")]
    RestoreStarted { collections: usize },

    #[serde(rename = "run:completed")]
    RunCompleted {
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: bool,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VaultEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: VaultEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = VaultEvent::CollectionSkipped {
            collection: CollectionRef::new("admin", "system.version"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "collection:skipped");
        assert_eq!(json["payload"]["collection"]["database"], "admin");
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        bus.emit(VaultEvent::RestoreStarted { collections: 0 });

        let mut rx = bus.subscribe();
        bus.emit(VaultEvent::RestoreStarted { collections: 2 });
        assert_eq!(rx.recv().await.unwrap(), VaultEvent::RestoreStarted { collections: 2 });
    }
}
