//! # Airwave
//!
//! Distributed execution core for a shared wireless channel in a
//! discrete-event network simulator.
//!
//! In the monolithic baseline, every radio holds a handle to one in-process
//! channel object that computes received power and propagation delay for
//! every other radio on each transmission. Airwave re-partitions that work
//! across operating-system processes connected by a message-passing fabric
//! while preserving the causal and numerical behavior of the baseline.
//!
//! ## Design Principles
//!
//! - **One channel rank**: a single process owns the device registry and the
//!   propagation engine ([`processor::ChannelProcessor`]).
//! - **Transparent stubs**: every device rank talks to a
//!   [`stub::ChannelStub`] exposing the same surface as the in-process
//!   channel; radios attach to it unchanged.
//! - **Byte-exact wire contract**: all cross-rank traffic uses the framed,
//!   network-byte-order messages in [`wire`], with exact linear powers
//!   carried as integer picowatts.
//! - **Conservative synchronization**: the core cooperates with the host
//!   simulator's safe-time barrier and never schedules into the past; a
//!   causal violation is fatal by design.
//! - **Single-threaded cooperation**: no worker threads; all state mutation
//!   happens inside receive-loop polls or stub operations on the simulator
//!   thread.

pub mod config;
pub mod error;
pub mod fabric;
pub mod models;
pub mod processor;
pub mod propagation;
pub mod radio;
pub mod registry;
pub mod stats;
pub mod stub;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use config::{CoreConfig, CoreConfigBuilder};
pub use error::{ChannelError, ChannelResult, ErrorKind};
pub use fabric::{Fabric, MemoryFabric, MemoryRouter, NullFabric};
pub use processor::ChannelProcessor;
pub use propagation::{PropagationDelayModel, PropagationEngine, PropagationLossModel};
pub use radio::{MockRadio, Radio, RadioHandle, Reception};
pub use registry::{DeviceRecord, DeviceRegistry};
pub use stats::RunSummary;
pub use stub::ChannelStub;
pub use types::{DeviceId, Position, Rank, SimTime};
pub use wire::{Message, MessageType};
