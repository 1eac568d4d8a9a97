//! Snapshot model and the message sent to viewers over WebSocket.
//! Keep `MemoryMessage` minimal and stable, it defines the wire format.

use chrono::{DateTime, Local};
use serde::Serialize;

pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Timestamp layout on the wire, e.g. `16-10-2026 08:15:02`.
pub const TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// One memory reading, taken once per sampling tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    pub used_percent: f64,
    pub captured_at: DateTime<Local>,
}

impl Snapshot {
    /// Build a snapshot from raw byte counters.
    pub fn from_bytes(total: u64, used: u64, free: u64, captured_at: DateTime<Local>) -> Self {
        let used_percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        Self {
            total_mb: total / BYTES_PER_MB,
            used_mb: used / BYTES_PER_MB,
            free_mb: free / BYTES_PER_MB,
            used_percent,
            captured_at,
        }
    }

    pub fn to_message(&self) -> MemoryMessage {
        MemoryMessage {
            total_memory: self.total_mb.to_string(),
            free_memory: self.free_mb.to_string(),
            used_memory: self.used_mb.to_string(),
            percentage_used_memory: format!("{:.2}", self.used_percent),
            time: self.captured_at.format(TIME_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryMessage {
    pub total_memory: String,
    pub free_memory: String,
    pub used_memory: String,
    pub percentage_used_memory: String,
    pub time: String,
}
