//! Per-run traffic and drop accounting.
//!
//! Both the processor and the stubs keep a [`RunSummary`]. Non-fatal drops
//! are counted here and reported at the end of a run; the JSON export is
//! the machine-readable form of that report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::wire::MessageType;

/// Aggregate counters for one process over one run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Messages sent, keyed by message type name.
    pub sent: BTreeMap<String, u64>,

    /// Messages received, keyed by message type name.
    pub received: BTreeMap<String, u64>,

    /// Total bytes handed to the fabric.
    pub bytes_sent: u64,

    /// Total bytes drained from the fabric.
    pub bytes_received: u64,

    /// Non-fatal drops, keyed by error kind name.
    pub drops: BTreeMap<String, u64>,

    /// Replayed messages detected by the sequence check and discarded.
    pub duplicates_dropped: u64,

    /// POSITION_UPDATE sends suppressed by the movement epsilon.
    pub position_updates_suppressed: u64,

    /// Largest number of devices registered at once.
    pub peak_device_count: usize,
}

impl RunSummary {
    /// Creates an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one outbound message of `len` bytes.
    pub fn record_send(&mut self, message_type: MessageType, len: usize) {
        *self.sent.entry(message_type.name().to_string()).or_default() += 1;
        self.bytes_sent += len as u64;
    }

    /// Records one inbound message of `len` bytes.
    pub fn record_receive(&mut self, message_type: MessageType, len: usize) {
        *self
            .received
            .entry(message_type.name().to_string())
            .or_default() += 1;
        self.bytes_received += len as u64;
    }

    /// Records a non-fatal drop.
    pub fn record_drop(&mut self, kind: ErrorKind) {
        *self.drops.entry(kind.name().to_string()).or_default() += 1;
    }

    /// Records a replayed message discarded by the sequence check.
    pub fn record_duplicate(&mut self) {
        self.duplicates_dropped += 1;
    }

    /// Records a position update suppressed by the epsilon.
    pub fn record_suppressed_position(&mut self) {
        self.position_updates_suppressed += 1;
    }

    /// Tracks the device-count high-water mark.
    pub fn observe_device_count(&mut self, count: usize) {
        self.peak_device_count = self.peak_device_count.max(count);
    }

    /// Total messages sent across all types.
    pub fn total_sent(&self) -> u64 {
        self.sent.values().sum()
    }

    /// Total messages received across all types.
    pub fn total_received(&self) -> u64 {
        self.received.values().sum()
    }

    /// Total non-fatal drops across all kinds.
    pub fn total_drops(&self) -> u64 {
        self.drops.values().sum()
    }

    /// Exports the summary as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
