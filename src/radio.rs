//! The radio seam: what the channel stub needs from a local radio.
//!
//! A radio hands the stub its registration parameters at attach time and
//! accepts receptions through its physical-layer entry point. The stub holds
//! only weak references to attached radios, so dropping a radio never leaks
//! a map entry past the next delivery attempt.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::types::{DeviceId, NodeId, PhyId, Position, SimTime};

/// What the monolithic channel would have delivered to a receiving radio.
#[derive(Clone, Debug, PartialEq)]
pub struct Reception {
    /// Device id of the transmitter.
    pub transmitter: DeviceId,
    /// Received power in linear watts, decoded from the canonical picowatt
    /// wire encoding.
    pub rx_power_w: f64,
    /// Received power in dBm; informational.
    pub rx_power_dbm: f64,
    /// Path loss in dB; informational.
    pub path_loss_db: f64,
    /// Distance to the transmitter in meters; informational.
    pub distance_m: f64,
    /// Carrier frequency of the transmission.
    pub frequency_hz: u32,
    /// Propagation delay in nanoseconds.
    pub propagation_delay_ns: SimTime,
    /// Simulation time the transmission started.
    pub tx_timestamp_ns: SimTime,
    /// The transmitted frame, byte for byte.
    pub payload: Bytes,
}

/// The surface a radio exposes to the channel stub.
pub trait Radio {
    /// Node identifier reported at registration.
    fn node_id(&self) -> NodeId;

    /// PHY index within the node.
    fn phy_id(&self) -> PhyId;

    /// Hash identifying the PHY type; informational.
    fn phy_type(&self) -> u32 {
        0
    }

    /// IEEE 802.11 channel number this radio listens on.
    fn channel_number(&self) -> u32;

    /// Channel width in MHz.
    fn channel_width_mhz(&self) -> u32 {
        20
    }

    /// Current position of the radio.
    fn position(&self) -> Position;

    /// Physical-layer reception entry point, invoked by the stub when a
    /// reception event is delivered.
    fn start_receive(&mut self, reception: Reception);
}

/// Shared handle to an attached radio.
///
/// The core is single-threaded; radios live on the simulator thread and are
/// shared through `Rc<RefCell<..>>`.
pub type RadioHandle = Rc<RefCell<dyn Radio>>;

/// A simple buffering radio.
///
/// Records every delivered reception in arrival order. Useful for tests and
/// single-process experiments.
#[derive(Debug)]
pub struct MockRadio {
    pub node_id: NodeId,
    pub phy_id: PhyId,
    pub channel_number: u32,
    pub position: Position,
    /// Receptions delivered so far, in delivery order.
    pub received: Vec<Reception>,
}

impl MockRadio {
    /// Creates a mock radio on channel 1 at the given position.
    pub fn new(node_id: NodeId, position: Position) -> Self {
        Self {
            node_id,
            phy_id: 0,
            channel_number: 1,
            position,
            received: Vec::new(),
        }
    }

    /// Sets the channel number.
    pub fn with_channel(mut self, channel_number: u32) -> Self {
        self.channel_number = channel_number;
        self
    }

    /// Wraps this radio in a shareable handle.
    pub fn into_handle(self) -> Rc<RefCell<MockRadio>> {
        Rc::new(RefCell::new(self))
    }
}

impl Radio for MockRadio {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn phy_id(&self) -> PhyId {
        self.phy_id
    }

    fn channel_number(&self) -> u32 {
        self.channel_number
    }

    fn position(&self) -> Position {
        self.position
    }

    fn start_receive(&mut self, reception: Reception) {
        self.received.push(reception);
    }
}
