// src/console.rs
//
// COM port console helpers: button definitions, command encoding, and the
// newline splitter for inbound console bytes.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// How a button's command string is interpreted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComMode {
    /// Plain text, terminated with CRLF.
    Text,
    /// Hex pairs (`DE AD BE EF`), whitespace tolerated, sent verbatim.
    Hex,
}

/// One console quick-command button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComButton {
    pub id: String,
    pub name: String,
    pub command: String,
    pub mode: ComMode,
    /// Number of sends per press. 1 with a zero period is a single
    /// immediate send.
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    /// Spacing between repeated sends, in ms.
    #[serde(default)]
    pub repeat_period_ms: u64,
}

fn default_repeat_count() -> u32 {
    1
}

/// Validate a button definition. Hex-mode commands must decode.
pub fn validate_button(button: &ComButton) -> EngineResult<()> {
    if button.command.is_empty() {
        return Err(EngineError::InvalidCommand(format!(
            "button '{}' has an empty command",
            button.name
        )));
    }
    if button.repeat_count == 0 {
        return Err(EngineError::InvalidCommand(format!(
            "button '{}' has repeat_count 0",
            button.name
        )));
    }
    if button.mode == ComMode::Hex {
        encode_command(&button.command, ComMode::Hex)?;
    }
    Ok(())
}

/// Encode a command string to wire bytes for the given mode.
pub fn encode_command(command: &str, mode: ComMode) -> EngineResult<Vec<u8>> {
    match mode {
        ComMode::Text => {
            let mut bytes = command.as_bytes().to_vec();
            bytes.extend_from_slice(b"\r\n");
            Ok(bytes)
        }
        ComMode::Hex => {
            let compact: String = command.chars().filter(|c| !c.is_whitespace()).collect();
            hex::decode(&compact)
                .map_err(|_| EngineError::InvalidCommand(format!("bad hex command '{}'", command)))
        }
    }
}

/// Accumulates inbound console bytes and yields whole lines.
///
/// The monitor renders whole lines only, so a trailing partial line is
/// held back until its newline arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every completed line (CR stripped, lossy UTF-8).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if self.pending.last() == Some(&b'\r') {
                    self.pending.pop();
                }
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                self.pending.clear();
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Drop any partial line (used when the console log is cleared).
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
