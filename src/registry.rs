//! Device registry owned by the channel processor.
//!
//! The registry maps globally unique device ids to the state the propagation
//! engine needs: owning rank, position, supported frequencies, and activity
//! timestamps. Ids are monotone and never reused within a run. Iteration is
//! in ascending device-id order, which the propagation engine relies on for
//! deterministic fan-out.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{DeviceId, NodeId, PhyId, Position, Rank, SimTime};

/// Center frequency in hertz for an IEEE 802.11 channel number.
///
/// Channels 1–13 map into the 2.4 GHz band (`2407 + 5·n` MHz); channel 14 is
/// the Japanese special case at 2484 MHz. Channel numbers above 14 nominally
/// sit in the 5 GHz band, which a 32-bit hertz field cannot represent; they
/// saturate at the field ceiling, which keeps them distinct from every
/// 2.4 GHz channel — all the frequency gate requires of them.
///
/// # Example
/// ```
/// use airwave::registry::channel_center_frequency_hz;
///
/// assert_eq!(channel_center_frequency_hz(1), 2_412_000_000);
/// assert_eq!(channel_center_frequency_hz(36), u32::MAX);
/// ```
pub fn channel_center_frequency_hz(channel_number: u32) -> u32 {
    match channel_number {
        1..=13 => 2_407_000_000 + 5_000_000 * channel_number,
        14 => 2_484_000_000,
        _ => u32::MAX,
    }
}

/// Registry record for one registered radio.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Id assigned by the registry on first registration.
    pub device_id: DeviceId,
    /// Rank that owns the radio. Never the channel rank.
    pub owning_rank: Rank,
    /// Node identifier supplied by the origin.
    pub node_id: NodeId,
    /// PHY index within the node.
    pub phy_id: PhyId,
    /// Position reported by the latest accepted update.
    pub position: Position,
    /// Antenna gain in dB. Not carried by the registration body; defaults
    /// to 0 until a future protocol version adds it.
    pub antenna_gain_db: f64,
    /// Channel center frequencies this radio listens on. Empty means
    /// frequency-agnostic.
    pub frequencies: BTreeSet<u32>,
    /// Simulation time of the last observed activity from this device.
    pub last_seen: SimTime,
    /// Cleared on deregistration paths that keep the record briefly alive.
    pub active: bool,
}

impl DeviceRecord {
    /// The frequency this device transmits on: its lowest registered center
    /// frequency, or `None` for a frequency-agnostic device.
    pub fn primary_frequency(&self) -> Option<u32> {
        self.frequencies.iter().next().copied()
    }

    /// Frequency gate used by the propagation engine: an empty set admits
    /// every transmission.
    pub fn supports_frequency(&self, frequency_hz: u32) -> bool {
        self.frequencies.is_empty() || self.frequencies.contains(&frequency_hz)
    }
}

/// The channel processor's table of registered devices.
///
/// Exclusively owned by the channel processor; the stub's fallback mode
/// keeps its own private instance.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceRecord>,
    /// Idempotence index: one logical radio registers at most once.
    by_origin: HashMap<(Rank, NodeId, PhyId), DeviceId>,
    next_id: DeviceId,
}

impl DeviceRegistry {
    /// Creates an empty registry. The first assigned id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a radio and returns its device id.
    ///
    /// Idempotent at the level of `(source_rank, node_id, phy_id)`: a second
    /// registration with the same tuple returns the previously assigned id
    /// and refreshes the mutable fields instead of inserting a duplicate.
    pub fn register(
        &mut self,
        source_rank: Rank,
        node_id: NodeId,
        phy_id: PhyId,
        position: Position,
        frequencies: BTreeSet<u32>,
        now: SimTime,
    ) -> DeviceId {
        let key = (source_rank, node_id, phy_id);
        if let Some(&existing) = self.by_origin.get(&key) {
            if let Some(record) = self.devices.get_mut(&existing) {
                record.position = position;
                record.frequencies = frequencies;
                record.last_seen = record.last_seen.max(now);
                record.active = true;
                debug!(
                    device_id = existing,
                    source_rank, node_id, "refreshed existing registration"
                );
                return existing;
            }
        }

        self.next_id += 1;
        let device_id = self.next_id;
        self.devices.insert(
            device_id,
            DeviceRecord {
                device_id,
                owning_rank: source_rank,
                node_id,
                phy_id,
                position,
                antenna_gain_db: 0.0,
                frequencies,
                last_seen: now,
                active: true,
            },
        );
        self.by_origin.insert(key, device_id);
        debug!(device_id, source_rank, node_id, phy_id, "registered device");
        device_id
    }

    /// Removes a device record. Unknown ids are logged and ignored.
    pub fn deregister(&mut self, device_id: DeviceId) -> bool {
        match self.devices.remove(&device_id) {
            Some(record) => {
                self.by_origin
                    .remove(&(record.owning_rank, record.node_id, record.phy_id));
                debug!(device_id, rank = record.owning_rank, "deregistered device");
                true
            }
            None => {
                warn!(device_id, "deregister for unknown device");
                false
            }
        }
    }

    /// Removes every device owned by `rank` and returns how many were
    /// dropped. Used when a peer rank is declared gone.
    pub fn deregister_rank(&mut self, rank: Rank) -> usize {
        let ids: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|r| r.owning_rank == rank)
            .map(|r| r.device_id)
            .collect();
        for id in &ids {
            self.deregister(*id);
        }
        ids.len()
    }

    /// Applies a position update.
    ///
    /// An update whose event timestamp is strictly older than the record's
    /// `last_seen` is stale and discarded. Returns true if applied.
    pub fn update_position(
        &mut self,
        device_id: DeviceId,
        position: Position,
        event_timestamp: SimTime,
    ) -> bool {
        match self.devices.get_mut(&device_id) {
            Some(record) => {
                if event_timestamp < record.last_seen {
                    debug!(
                        device_id,
                        event_timestamp,
                        last_seen = record.last_seen,
                        "discarded stale position update"
                    );
                    return false;
                }
                record.position = position;
                record.last_seen = event_timestamp;
                true
            }
            None => {
                warn!(device_id, "position update for unknown device");
                false
            }
        }
    }

    /// Marks activity from a device without changing any other state.
    pub fn touch(&mut self, device_id: DeviceId, now: SimTime) {
        if let Some(record) = self.devices.get_mut(&device_id) {
            record.last_seen = record.last_seen.max(now);
        }
    }

    /// Looks up a single record.
    pub fn get(&self, device_id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }

    /// Read-only view of every record, in ascending device-id order.
    pub fn snapshot_all(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// True if the id has a live record.
    pub fn is_registered(&self, device_id: DeviceId) -> bool {
        self.devices.contains_key(&device_id)
    }

    /// Number of live records.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Ids of every live record, ascending.
    pub fn registered_devices(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    /// The last id handed out. Ids are never recycled, so this only grows.
    pub fn high_water_mark(&self) -> DeviceId {
        self.next_id
    }

    /// Drops every record. Used at shutdown; the id counter keeps its value
    /// so a partially torn-down run can never reuse an id.
    pub fn clear(&mut self) {
        self.devices.clear();
        self.by_origin.clear();
    }
}
