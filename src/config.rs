// src/config.rs
//
// Engine configuration. Everything has a sensible default so callers can
// start from `EngineConfig::default()` and override the odd field.

use serde::{Deserialize, Serialize};

use crate::logbuf::DEFAULT_LOG_CAPACITY;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Line capacity of the bus traffic log.
    #[serde(default = "default_log_capacity")]
    pub bus_log_capacity: usize,
    /// Line capacity of the COM console log.
    #[serde(default = "default_log_capacity")]
    pub console_log_capacity: usize,
    /// How long `open()` may stay in Connecting before failing, in ms.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Capacity of the change-notification channel. Lagging subscribers
    /// drop events and re-read snapshots.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

fn default_open_timeout_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bus_log_capacity: default_log_capacity(),
            console_log_capacity: default_log_capacity(),
            open_timeout_ms: default_open_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}
