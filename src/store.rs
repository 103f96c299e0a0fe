// src/store.rs
//
// Persistence glue. Saved transmit messages, COM buttons and rules are
// owned by an external key-value store; the engine (de)serializes them as
// JSON under fixed keys and revalidates on every load.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Storage key for the saved transmit message list.
pub const KEY_TX_MESSAGES: &str = "tx_messages";
/// Storage key for the COM button list.
pub const KEY_COM_BUTTONS: &str = "com_buttons";
/// Storage key for the rule list.
pub const KEY_RULES: &str = "rules";

/// Injected key-value store. Implementations are expected to be cheap to
/// call; values are opaque strings (the engine writes JSON).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// Load a JSON list from the store. A missing key is an empty list; a
/// corrupt value is an error so callers can surface it instead of silently
/// wiping saved data.
pub fn load_list<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> EngineResult<Vec<T>> {
    match store.get(key) {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(&raw).map_err(|e| {
            EngineError::InvalidMessage(format!("corrupt '{}' store entry: {}", key, e))
        }),
    }
}

/// Serialize and persist a list under the given key.
pub fn save_list<T: Serialize>(store: &dyn KvStore, key: &str, list: &[T]) {
    match serde_json::to_string(list) {
        Ok(json) => store.set(key, json),
        Err(e) => tracing::warn!("failed to serialize '{}' list: {}", key, e),
    }
}

/// In-memory store for tests and headless use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
        }
    }
}
