// src/events.rs
//
// Change notifications for the UI layer. The engine emits coarse-grained
// events; subscribers re-read snapshots rather than consuming payloads, so
// a lagging receiver loses nothing but wake-ups.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::logbuf::LogChannel;
use crate::transport::ConnectionState;

/// Something the UI may want to re-render for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    FrameTableChanged,
    LogAppended { channel: LogChannel },
    ConnectionStateChanged { state: ConnectionState },
    ActiveTxSetChanged,
}

/// Broadcast fan-out of engine events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Best-effort send; an event with no subscribers is simply dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
