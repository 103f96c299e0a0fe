// src/error.rs
//
// Error taxonomy for the session engine.
// Every command entry point returns one of these kinds; none are fatal.

use serde::{Deserialize, Serialize};

/// Errors surfaced by the engine's command API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    /// Operation requires an open CAN connection.
    #[error("CAN bus is not connected")]
    NotConnected,

    /// A periodic transmit job already exists for this id_key.
    #[error("periodic transmit '{0}' is already active")]
    AlreadyActive(String),

    /// The transport did not confirm the open within the configured timeout.
    #[error("open timed out")]
    OpenTimeout,

    /// Speed cannot change while the bus is open.
    #[error("speed change rejected while connected")]
    SpeedChangeRejected,

    /// The underlying channel rejected a transmit.
    #[error("transmit failed: {0}")]
    TransmitFailed(String),

    /// A rule failed load-time validation. The whole incoming list is rejected.
    #[error("invalid rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },

    /// A console command or COM button definition failed validation.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// A saved transmit message failed validation.
    #[error("invalid transmit message: {0}")]
    InvalidMessage(String),

    /// Asynchronous lower-layer failure, forwarded from the transport.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Shorthand used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
