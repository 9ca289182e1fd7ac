//! Fabric adapter: the thin abstraction over the host message-passing
//! primitives used by both the channel processor and the device stubs.
//!
//! The trait requires exactly what the core consumes: rank identity,
//! non-blocking send, polled receive, and the conservative-synchronization
//! time barrier. An MPI-backed implementation lives with the host
//! integration; [`MemoryRouter`] provides the in-process implementation used
//! by single-process runs and the test suite.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{ChannelError, ChannelResult};
use crate::types::{Rank, SimTime};
use crate::wire::MessageType;

/// Fabric-level message tag.
///
/// Tags are strictly informational routing hints; the header's message type
/// is authoritative.
pub type Tag = u32;

/// Reserved tag namespace.
pub mod tags {
    use super::Tag;

    pub const TAG_REGISTER: Tag = 1;
    pub const TAG_REMOVE: Tag = 2;
    pub const TAG_CONFIG: Tag = 3;
    pub const TAG_TX: Tag = 4;
    pub const TAG_RX: Tag = 5;
    pub const TAG_POSITION: Tag = 6;
    pub const TAG_HEARTBEAT: Tag = 7;
    pub const TAG_ACK: Tag = 8;
    pub const TAG_ERROR: Tag = 9;
}

/// The tag conventionally used for a message type.
pub fn tag_for(message_type: MessageType) -> Tag {
    use tags::*;
    match message_type {
        MessageType::DeviceRegister => TAG_REGISTER,
        MessageType::DeviceRemove => TAG_REMOVE,
        MessageType::ConfigDelayModel | MessageType::ConfigLossModel => TAG_CONFIG,
        MessageType::TxRequest | MessageType::TxStartNotify | MessageType::TxEndNotify => TAG_TX,
        MessageType::RxNotification => TAG_RX,
        MessageType::PositionUpdate => TAG_POSITION,
        MessageType::Heartbeat => TAG_HEARTBEAT,
        MessageType::ConfigAck => TAG_ACK,
        MessageType::ErrorNotify => TAG_ERROR,
    }
}

/// Capabilities the core requires from the host fabric.
///
/// Sends are non-blocking: they return once the bytes are queued for
/// transmission, and the buffer belongs to the adapter from then on.
/// `drain` must not block; it invokes the callback once per message
/// currently available, preserving per (source, destination) FIFO order.
pub trait Fabric {
    /// This process's rank and the world size.
    fn identity(&self) -> (Rank, u32);

    /// Queues a message for transmission to `target`.
    fn send(&mut self, target: Rank, tag: Tag, bytes: Bytes) -> ChannelResult<()>;

    /// Delivers every currently available message to `callback` as
    /// `(source_rank, tag, bytes)`.
    fn drain(&mut self, callback: &mut dyn FnMut(Rank, Tag, Bytes));

    /// The current safe simulation time under conservative synchronization.
    fn barrier_time(&self) -> SimTime;
}

/// Shared state behind every [`MemoryFabric`] endpoint of one router.
///
/// One inbound FIFO per rank keeps per source–destination ordering trivially
/// intact; the safe-time barrier is a single shared counter the driver
/// advances.
#[derive(Debug)]
pub struct MemoryRouter {
    world_size: u32,
    queues: Vec<Mutex<VecDeque<(Rank, Tag, Bytes)>>>,
    safe_time: AtomicU64,
}

impl MemoryRouter {
    /// Creates a router for `world_size` ranks with the barrier at time 0.
    pub fn new(world_size: u32) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            queues: (0..world_size).map(|_| Mutex::new(VecDeque::new())).collect(),
            safe_time: AtomicU64::new(0),
        })
    }

    /// Creates the fabric endpoint for one rank.
    pub fn endpoint(self: &Arc<Self>, rank: Rank) -> ChannelResult<MemoryFabric> {
        if rank >= self.world_size {
            return Err(ChannelError::Fabric(format!(
                "rank {rank} outside world of size {}",
                self.world_size
            )));
        }
        Ok(MemoryFabric {
            rank,
            router: Arc::clone(self),
        })
    }

    /// Advances the shared safe-time barrier. Time never moves backwards.
    pub fn advance_to(&self, safe_time: SimTime) {
        self.safe_time.fetch_max(safe_time, Ordering::SeqCst);
    }

    /// The current safe simulation time.
    pub fn safe_time(&self) -> SimTime {
        self.safe_time.load(Ordering::SeqCst)
    }
}

/// In-process fabric endpoint bound to one rank of a [`MemoryRouter`].
#[derive(Clone, Debug)]
pub struct MemoryFabric {
    rank: Rank,
    router: Arc<MemoryRouter>,
}

impl Fabric for MemoryFabric {
    fn identity(&self) -> (Rank, u32) {
        (self.rank, self.router.world_size)
    }

    fn send(&mut self, target: Rank, tag: Tag, bytes: Bytes) -> ChannelResult<()> {
        let queue = self.router.queues.get(target as usize).ok_or_else(|| {
            ChannelError::Fabric(format!(
                "send to rank {target} outside world of size {}",
                self.router.world_size
            ))
        })?;
        queue.lock().push_back((self.rank, tag, bytes));
        Ok(())
    }

    fn drain(&mut self, callback: &mut dyn FnMut(Rank, Tag, Bytes)) {
        // Take the whole queue under the lock, run the callback outside it.
        let pending = std::mem::take(&mut *self.router.queues[self.rank as usize].lock());
        for (source, tag, bytes) in pending {
            callback(source, tag, bytes);
        }
    }

    fn barrier_time(&self) -> SimTime {
        self.router.safe_time()
    }
}

/// A fabric that carries nothing.
///
/// Used by the stub's fallback mode, where every operation is served
/// in-process and nothing must ever reach a wire. Sends fail, drains are
/// empty, and the barrier sits at time 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullFabric;

impl Fabric for NullFabric {
    fn identity(&self) -> (Rank, u32) {
        (0, 1)
    }

    fn send(&mut self, target: Rank, _tag: Tag, _bytes: Bytes) -> ChannelResult<()> {
        Err(ChannelError::Fabric(format!(
            "null fabric cannot send to rank {target}"
        )))
    }

    fn drain(&mut self, _callback: &mut dyn FnMut(Rank, Tag, Bytes)) {}

    fn barrier_time(&self) -> SimTime {
        0
    }
}
