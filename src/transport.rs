// src/transport.rs
//
// Transport abstraction for the physical CAN adapter and its serial
// console side-channel. Concrete drivers live outside this crate; the
// engine only ever talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::frame::CanId;

/// Bus bit rate, in kbit/s. The selector the monitor UI exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanSpeed {
    #[serde(rename = "125")]
    K125,
    #[serde(rename = "250")]
    K250,
    #[serde(rename = "500")]
    K500,
}

impl CanSpeed {
    pub fn kbps(&self) -> u32 {
        match self {
            CanSpeed::K125 => 125,
            CanSpeed::K250 => 250,
            CanSpeed::K500 => 500,
        }
    }
}

impl std::fmt::Display for CanSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}K", self.kbps())
    }
}

/// Connection lifecycle of the CAN side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Asynchronous failure reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The link dropped out from under the session.
    ConnectionLost,
    /// The adapter reported a fault.
    Device(String),
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::ConnectionLost => write!(f, "connection lost"),
            TransportErrorKind::Device(detail) => write!(f, "device fault: {}", detail),
        }
    }
}

/// Driver contract for a CAN adapter with an independent serial console.
///
/// Implementations must not block: every method is async and the engine
/// may hold its state lock across these calls to serialize bus activity.
/// Inbound traffic flows the other way — the driver calls the session's
/// `on_frame_received` / `on_console_bytes_received` entry points.
#[async_trait]
pub trait CanTransport: Send + Sync {
    /// Bring the CAN side up at the given bit rate.
    async fn open(&self, speed: CanSpeed) -> EngineResult<()>;

    /// Tear the CAN side down. Must be idempotent.
    async fn close(&self);

    /// Push one frame onto the bus.
    async fn send_frame(&self, id: CanId, payload: &[u8]) -> EngineResult<()>;

    /// Write raw bytes to the serial console. Independent of CAN state.
    async fn send_console(&self, bytes: &[u8]) -> EngineResult<()>;
}
