// src/frame.rs
//
// CAN identifiers, frames, and the deduplicating frame table.
// The table keeps one entry per distinct identifier with a monotonic
// occurrence count; the UI reads sorted snapshots.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Maximum payload length for classic CAN.
pub const MAX_PAYLOAD_LEN: usize = 8;

/// Extended (29-bit) identifier ceiling.
const MAX_CAN_ID: u32 = 0x1FFF_FFFF;

// ============================================================================
// CanId
// ============================================================================

/// CAN arbitration identifier.
///
/// Canonical text form is `0x` followed by uppercase hex digits with no
/// leading zeros (`0x100`, `0x1FFFFFFF`). Snapshot ordering is lexicographic
/// over this form, matching how the monitor UI sorts its live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanId(u32);

impl CanId {
    /// Parse an identifier from hex text. Accepts an optional `0x`/`0X`
    /// prefix and mixed-case digits.
    pub fn parse(text: &str) -> EngineResult<Self> {
        let digits = text
            .trim()
            .strip_prefix("0x")
            .or_else(|| text.trim().strip_prefix("0X"))
            .unwrap_or_else(|| text.trim());

        if digits.is_empty() {
            return Err(EngineError::InvalidMessage("empty identifier".into()));
        }

        let value = u32::from_str_radix(digits, 16)
            .map_err(|_| EngineError::InvalidMessage(format!("bad identifier '{}'", text)))?;

        if value > MAX_CAN_ID {
            return Err(EngineError::InvalidMessage(format!(
                "identifier 0x{:X} exceeds 29 bits",
                value
            )));
        }

        Ok(CanId(value))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Canonical display form, also the snapshot sort key.
    pub fn canonical(&self) -> String {
        format!("0x{:X}", self.0)
    }
}

impl std::fmt::Display for CanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl TryFrom<String> for CanId {
    type Error = EngineError;

    fn try_from(s: String) -> EngineResult<Self> {
        CanId::parse(&s)
    }
}

impl From<CanId> for String {
    fn from(id: CanId) -> String {
        id.canonical()
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Direction of a frame relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rx,
    Tx,
}

/// One CAN bus message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: CanId,
    pub payload: Vec<u8>,
    pub direction: Direction,
}

impl Frame {
    /// Build a frame, validating the payload length (0–8 bytes).
    pub fn new(id: CanId, payload: Vec<u8>, direction: Direction) -> EngineResult<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EngineError::InvalidMessage(format!(
                "payload length {} exceeds {} bytes",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        Ok(Frame {
            id,
            payload,
            direction,
        })
    }

    /// Payload rendered as space-separated uppercase hex pairs.
    pub fn payload_hex(&self) -> String {
        payload_hex(&self.payload)
    }
}

/// Render a payload as space-separated uppercase hex pairs (`01 A2 FF`).
pub fn payload_hex(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// FrameTable
// ============================================================================

/// One row of the live view: latest payload plus an occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTableEntry {
    pub id: CanId,
    pub payload: Vec<u8>,
    pub count: u64,
    pub last_seen_us: u64,
}

/// Deduplicating store of received frames, keyed by identifier.
///
/// Entries are never removed during a session — only `clear()` resets the
/// table. `update` is the single writer.
#[derive(Debug, Default)]
pub struct FrameTable {
    entries: HashMap<CanId, FrameTableEntry>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame. Returns true when the identifier was not seen before.
    pub fn update(&mut self, frame: &Frame) -> bool {
        let now = now_us();
        match self.entries.get_mut(&frame.id) {
            Some(entry) => {
                entry.payload = frame.payload.clone();
                entry.count += 1;
                entry.last_seen_us = now;
                false
            }
            None => {
                self.entries.insert(
                    frame.id,
                    FrameTableEntry {
                        id: frame.id,
                        payload: frame.payload.clone(),
                        count: 1,
                        last_seen_us: now,
                    },
                );
                true
            }
        }
    }

    /// Defensive copy of all entries, sorted by canonical identifier text.
    pub fn snapshot(&self) -> Vec<FrameTableEntry> {
        let mut rows: Vec<FrameTableEntry> = self.entries.values().cloned().collect();
        rows.sort_by(|a, b| a.id.canonical().cmp(&b.id.canonical()));
        rows
    }

    /// Number of distinct identifiers seen since the last clear.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries. Used on an explicit clear command, not on open.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
