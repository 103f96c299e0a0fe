// src/logbuf.rs
//
// Bounded, pausable log ring. Two independent instances back the bus
// traffic view and the COM port console.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::frame::now_us;

/// Which log a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Bus,
    Console,
}

/// Direction/severity tag on a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTag {
    Rx,
    Tx,
    Error,
    /// Annotations, imported lines, lifecycle notes.
    Note,
}

/// One log record. `display()` renders the text the UI shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp_us: u64,
    pub tag: LogTag,
    pub text: String,
}

impl LogLine {
    pub fn new(tag: LogTag, text: impl Into<String>) -> Self {
        LogLine {
            timestamp_us: now_us(),
            tag,
            text: text.into(),
        }
    }

    /// Render as `HH:MM:SS.mmm <marker> text` in local time.
    /// The `TX →` marker is what the console view colour-keys on.
    pub fn display(&self) -> String {
        let secs = (self.timestamp_us / 1_000_000) as i64;
        let micros = (self.timestamp_us % 1_000_000) as u32;
        let time = chrono::DateTime::from_timestamp(secs, micros * 1000)
            .map(|t| {
                t.with_timezone(&chrono::Local)
                    .format("%H:%M:%S%.3f")
                    .to_string()
            })
            .unwrap_or_default();

        let marker = match self.tag {
            LogTag::Rx => "RX ←",
            LogTag::Tx => "TX →",
            LogTag::Error => "!",
            LogTag::Note => "·",
        };

        format!("{} {} {}", time, marker, self.text)
    }
}

/// Default ring capacity when the config does not override it.
pub const DEFAULT_LOG_CAPACITY: usize = 2000;

/// Append-only ring of log lines, oldest evicted first.
///
/// Pausing suppresses new arrivals without touching buffered lines; lines
/// arriving while paused are dropped, not queued.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
    paused: bool,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity: capacity.max(1),
            paused: false,
        }
    }

    /// Push a line, evicting from the head once over capacity.
    /// No-op while paused.
    pub fn append(&mut self, line: LogLine) {
        if self.paused {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Empty the buffer. Capacity and pause state are unaffected.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Replace content with externally captured lines (log import).
    /// Ignores the pause flag; keeps the newest `capacity` lines when the
    /// import is larger than the ring.
    pub fn import_lines(&mut self, lines: Vec<String>) {
        self.lines.clear();
        let skip = lines.len().saturating_sub(self.capacity);
        for text in lines.into_iter().skip(skip) {
            self.lines.push_back(LogLine::new(LogTag::Note, text));
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Defensive copy in arrival order.
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }
}
