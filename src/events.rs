//! Dashboard events fanned out to WebSocket clients.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::pipeline::RunReport;
use crate::review::model::EmailRecord;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something a connected dashboard should know about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The pipeline stored a new record.
    EmailCreated { email: EmailRecord },
    /// A record was edited, regenerated or sent.
    EmailUpdated { email: EmailRecord },
    /// Full snapshot, sent on connect and after a lagged receiver.
    EmailsSync { emails: Vec<EmailRecord> },
    /// A pipeline run completed.
    PipelineFinished { report: RunReport },
}

/// Broadcast hub. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let receivers = self.tx.send(event).unwrap_or(0);
        debug!(receivers, "Event published");
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
