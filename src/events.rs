//! File change notifications.
//!
//! The scheduler publishes one [`FileEvent`] per path touched by a successful
//! applying tool call. Publishing is fire-and-forget; a slow or absent
//! subscriber never blocks tool execution.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// A change made to a project file, by root-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "snake_case")]
pub enum FileEvent {
    FileCreated(String),
    FileModified(String),
    FileDeleted(String),
}

impl FileEvent {
    pub fn path(&self) -> &str {
        match self {
            FileEvent::FileCreated(p) | FileEvent::FileModified(p) | FileEvent::FileDeleted(p) => p,
        }
    }

    /// Event for a path given whether it existed before and after a change.
    /// `None` when the file was absent on both sides.
    pub fn from_transition(path: &str, existed_before: bool, exists_after: bool) -> Option<Self> {
        match (existed_before, exists_after) {
            (false, true) => Some(FileEvent::FileCreated(path.to_string())),
            (true, true) => Some(FileEvent::FileModified(path.to_string())),
            (true, false) => Some(FileEvent::FileDeleted(path.to_string())),
            (false, false) => None,
        }
    }
}

/// Receiver of file change notifications.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: FileEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: FileEvent) {}
}

/// Sink that logs each event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: FileEvent) {
        match &event {
            FileEvent::FileCreated(path) => info!("📄 Created {}", path),
            FileEvent::FileModified(path) => info!("✏️  Modified {}", path),
            FileEvent::FileDeleted(path) => info!("🗑️  Deleted {}", path),
        }
    }
}

/// In-process fan-out over a `tokio::sync::broadcast` channel.
///
/// Subscribers that fall behind by more than the channel capacity miss the
/// oldest events (`RecvError::Lagged`).
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<FileEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: FileEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}
