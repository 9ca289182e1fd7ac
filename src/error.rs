//! Error taxonomy for the distributed channel core.
//!
//! Every failure is classified by an [`ErrorKind`] that also defines the
//! numeric code carried in `ERROR_NOTIFY` messages. Kinds split into *local*
//! errors (the offending message is dropped and the process continues) and
//! *fatal* errors (the process logs and exits non-zero; conservative
//! synchronization guarantees these never occur in a correct configuration).

use std::time::Duration;

use thiserror::Error;

use crate::types::{DeviceId, Rank, SequenceNumber, SimTime};
use crate::wire::WireError;

/// Classification of a channel-core failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A header failed validation or a sequence number regressed.
    ProtocolViolation,
    /// A message referenced a device id with no registry record.
    UnknownDevice,
    /// A reception would have been scheduled in the past.
    CausalViolation,
    /// A propagation or delay model failed to evaluate.
    ModelError,
    /// The fabric reported a transport-level failure.
    FabricError,
    /// No registration acknowledgement arrived within the configured window.
    RegistrationTimeout,
    /// The process is tearing down; in-flight operations resolve with this.
    Shutdown,
}

impl ErrorKind {
    /// The numeric code used in `ERROR_NOTIFY` bodies.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::ProtocolViolation => 1,
            ErrorKind::UnknownDevice => 2,
            ErrorKind::CausalViolation => 3,
            ErrorKind::ModelError => 4,
            ErrorKind::FabricError => 5,
            ErrorKind::RegistrationTimeout => 6,
            ErrorKind::Shutdown => 7,
        }
    }

    /// Decodes a wire code back into a kind.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ErrorKind::ProtocolViolation),
            2 => Some(ErrorKind::UnknownDevice),
            3 => Some(ErrorKind::CausalViolation),
            4 => Some(ErrorKind::ModelError),
            5 => Some(ErrorKind::FabricError),
            6 => Some(ErrorKind::RegistrationTimeout),
            7 => Some(ErrorKind::Shutdown),
            _ => None,
        }
    }

    /// Short name for log lines and summary counters.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorKind::UnknownDevice => "UNKNOWN_DEVICE",
            ErrorKind::CausalViolation => "CAUSAL_VIOLATION",
            ErrorKind::ModelError => "MODEL_ERROR",
            ErrorKind::FabricError => "FABRIC_ERROR",
            ErrorKind::RegistrationTimeout => "REGISTRATION_TIMEOUT",
            ErrorKind::Shutdown => "SHUTDOWN",
        }
    }
}

/// Errors surfaced by channel-core operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Header-level validation failure on a single message. Local: the
    /// message is dropped.
    #[error("protocol violation from rank {source_rank}: {detail}")]
    Protocol { source_rank: Rank, detail: String },

    /// A message could not be framed or parsed at all. Fatal.
    #[error("framing error from rank {source_rank}: {source}")]
    Framing {
        source_rank: Rank,
        #[source]
        source: WireError,
    },

    /// Sequence number went backwards on a (source rank, type) stream. Fatal.
    #[error(
        "sequence regression from rank {source_rank} type {type_name}: \
         got {got} after {last}"
    )]
    SequenceRegression {
        source_rank: Rank,
        type_name: &'static str,
        got: SequenceNumber,
        last: SequenceNumber,
    },

    /// A message referenced an unregistered device. Local.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// A reception would be delivered before the current simulation time.
    /// Fatal.
    #[error("causal violation: reception at {scheduled}ns is before current time {now}ns")]
    Causal { scheduled: SimTime, now: SimTime },

    /// Model evaluation failed. Local per receiver.
    #[error("model error: {0}")]
    Model(String),

    /// Transport-level failure reported by the fabric. Fatal.
    #[error("fabric error: {0}")]
    Fabric(String),

    /// The registration round-trip did not complete in time.
    #[error("registration timed out after {0:?}")]
    RegistrationTimeout(Duration),

    /// The process is shutting down.
    #[error("shutting down")]
    Shutdown,
}

impl ChannelError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Protocol { .. }
            | ChannelError::Framing { .. }
            | ChannelError::SequenceRegression { .. } => ErrorKind::ProtocolViolation,
            ChannelError::UnknownDevice(_) => ErrorKind::UnknownDevice,
            ChannelError::Causal { .. } => ErrorKind::CausalViolation,
            ChannelError::Model(_) => ErrorKind::ModelError,
            ChannelError::Fabric(_) => ErrorKind::FabricError,
            ChannelError::RegistrationTimeout(_) => ErrorKind::RegistrationTimeout,
            ChannelError::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// True if this error must abort the process.
    ///
    /// Protocol violations are fatal at the framing/sequencing level but
    /// local for a single malformed-yet-framable message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::Framing { .. }
                | ChannelError::SequenceRegression { .. }
                | ChannelError::Causal { .. }
                | ChannelError::Fabric(_)
        )
    }
}

/// Result alias used by every public operation in the crate.
pub type ChannelResult<T> = Result<T, ChannelError>;
