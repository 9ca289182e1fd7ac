//! Wire format for all channel-core communication.
//!
//! These types are the protocol. Every field, every size, and the exact
//! byte order are part of the wire contract between the channel processor
//! and the device-side stubs; changing anything here is a breaking change.
//!
//! All integers are written in network byte order; IEEE-754 doubles have
//! their bit pattern written in network byte order. Exact linear powers
//! travel as integer picowatts (see [`crate::types::watts_to_picowatts`]);
//! decibel values are informational doubles.
//!
//! Every message begins with a fixed 44-byte [`Header`] carrying the total
//! length, so the receive loop can frame a message before trusting anything
//! else in it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::types::{DeviceId, Position, Rank, SequenceNumber, SimTime};

/// Serialized header size in bytes.
pub const HEADER_LEN: usize = 44;

/// Current header version.
pub const HEADER_VERSION: u32 = 1;

/// Upper bound on a framed message, header included.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

// ── Message types ────────────────────────────────────────────────────────────

/// Enumerated message types.
///
/// Device→channel types occupy the 100 range, channel→device the 200 range,
/// and bidirectional types the 300 range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageType {
    DeviceRegister = 100,
    ConfigDelayModel = 101,
    ConfigLossModel = 102,
    TxRequest = 103,
    DeviceRemove = 104,
    PositionUpdate = 105,
    RxNotification = 200,
    TxStartNotify = 201,
    TxEndNotify = 202,
    ConfigAck = 203,
    ErrorNotify = 204,
    Heartbeat = 301,
}

impl MessageType {
    /// Decodes a wire value into a message type.
    pub fn from_wire(value: u32) -> Result<Self, WireError> {
        match value {
            100 => Ok(MessageType::DeviceRegister),
            101 => Ok(MessageType::ConfigDelayModel),
            102 => Ok(MessageType::ConfigLossModel),
            103 => Ok(MessageType::TxRequest),
            104 => Ok(MessageType::DeviceRemove),
            105 => Ok(MessageType::PositionUpdate),
            200 => Ok(MessageType::RxNotification),
            201 => Ok(MessageType::TxStartNotify),
            202 => Ok(MessageType::TxEndNotify),
            203 => Ok(MessageType::ConfigAck),
            204 => Ok(MessageType::ErrorNotify),
            301 => Ok(MessageType::Heartbeat),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }

    /// Human-readable name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::DeviceRegister => "DEVICE_REGISTER",
            MessageType::ConfigDelayModel => "CONFIG_DELAY_MODEL",
            MessageType::ConfigLossModel => "CONFIG_LOSS_MODEL",
            MessageType::TxRequest => "TX_REQUEST",
            MessageType::DeviceRemove => "DEVICE_REMOVE",
            MessageType::PositionUpdate => "POSITION_UPDATE",
            MessageType::RxNotification => "RX_NOTIFICATION",
            MessageType::TxStartNotify => "TX_START_NOTIFY",
            MessageType::TxEndNotify => "TX_END_NOTIFY",
            MessageType::ConfigAck => "CONFIG_ACK",
            MessageType::ErrorNotify => "ERROR_NOTIFY",
            MessageType::Heartbeat => "HEARTBEAT",
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors raised while interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("unknown config target: {0}")]
    UnknownConfigTarget(u32),

    #[error("unknown header version: {0}")]
    UnknownVersion(u32),

    #[error("message truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("total length {0} outside [{HEADER_LEN}, {MAX_MESSAGE_SIZE}]")]
    LengthOutOfRange(u32),

    #[error("total length {declared} does not match framed size {framed}")]
    LengthMismatch { declared: u32, framed: usize },

    #[error("body checksum mismatch: header 0x{expected:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("body of {0} bytes exceeds maximum message size")]
    BodyTooLarge(usize),
}

fn need(buf: &impl Buf, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// xor-fold checksum over the body, 32-bit words in network byte order.
///
/// Trailing bytes are zero-padded to a full word. A stored value of 0 means
/// checksumming is disabled for that message.
pub fn body_checksum(body: &[u8]) -> u32 {
    let mut acc = 0u32;
    for chunk in body.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        acc ^= u32::from_be_bytes(word);
    }
    acc
}

// ── Header ───────────────────────────────────────────────────────────────────

/// Common 44-byte message header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Type of the message body that follows.
    pub message_type: MessageType,
    /// Total message size in bytes, header included.
    pub total_length: u32,
    /// Rank that emitted the message.
    pub source_rank: Rank,
    /// Rank the message is addressed to.
    pub destination_rank: Rank,
    /// Simulation time of the event the message describes.
    pub timestamp_ns: SimTime,
    /// Monotone sequence number per (source rank, message type) stream.
    pub sequence: SequenceNumber,
    /// Device id the message concerns; 0 when not applicable.
    pub device_id: DeviceId,
    /// Must be written as 0; ignored on receive.
    pub reserved: u32,
    /// Header layout version, currently [`HEADER_VERSION`].
    pub header_version: u32,
    /// xor-fold of the body words; 0 disables verification.
    pub body_checksum: u32,
}

impl Header {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.message_type as u32);
        buf.put_u32(self.total_length);
        buf.put_u32(self.source_rank);
        buf.put_u32(self.destination_rank);
        buf.put_u64(self.timestamp_ns);
        buf.put_u32(self.sequence);
        buf.put_u32(self.device_id);
        buf.put_u32(self.reserved);
        buf.put_u32(self.header_version);
        buf.put_u32(self.body_checksum);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, HEADER_LEN)?;
        let message_type = MessageType::from_wire(buf.get_u32())?;
        let total_length = buf.get_u32();
        let source_rank = buf.get_u32();
        let destination_rank = buf.get_u32();
        let timestamp_ns = buf.get_u64();
        let sequence = buf.get_u32();
        let device_id = buf.get_u32();
        let reserved = buf.get_u32();
        let header_version = buf.get_u32();
        let body_checksum = buf.get_u32();

        if header_version != HEADER_VERSION {
            return Err(WireError::UnknownVersion(header_version));
        }
        if (total_length as usize) < HEADER_LEN || total_length as usize > MAX_MESSAGE_SIZE {
            return Err(WireError::LengthOutOfRange(total_length));
        }

        Ok(Self {
            message_type,
            total_length,
            source_rank,
            destination_rank,
            timestamp_ns,
            sequence,
            device_id,
            reserved,
            header_version,
            body_checksum,
        })
    }
}

// ── Bodies ───────────────────────────────────────────────────────────────────

/// Body of a `DEVICE_REGISTER` message.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRegisterBody {
    pub phy_id: u32,
    /// Hash of the PHY type name; informational.
    pub phy_type: u32,
    pub channel_number: u32,
    pub channel_width_mhz: u32,
    pub node_id: u32,
    pub position: Position,
}

impl DeviceRegisterBody {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.phy_id);
        buf.put_u32(self.phy_type);
        buf.put_u32(self.channel_number);
        buf.put_u32(self.channel_width_mhz);
        buf.put_u32(self.node_id);
        buf.put_f64(self.position.x);
        buf.put_f64(self.position.y);
        buf.put_f64(self.position.z);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, 4 * 5 + 8 * 3)?;
        Ok(Self {
            phy_id: buf.get_u32(),
            phy_type: buf.get_u32(),
            channel_number: buf.get_u32(),
            channel_width_mhz: buf.get_u32(),
            node_id: buf.get_u32(),
            position: Position::new(buf.get_f64(), buf.get_f64(), buf.get_f64()),
        })
    }
}

/// Body of a `POSITION_UPDATE` message.
///
/// Velocity and heading are informational telemetry; the registry keys its
/// staleness check on the header timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionUpdateBody {
    pub device_id: DeviceId,
    pub position: Position,
    pub velocity: f64,
    pub heading: f64,
}

impl PositionUpdateBody {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.device_id);
        buf.put_f64(self.position.x);
        buf.put_f64(self.position.y);
        buf.put_f64(self.position.z);
        buf.put_f64(self.velocity);
        buf.put_f64(self.heading);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, 4 + 8 * 5)?;
        Ok(Self {
            device_id: buf.get_u32(),
            position: Position::new(buf.get_f64(), buf.get_f64(), buf.get_f64()),
            velocity: buf.get_f64(),
            heading: buf.get_f64(),
        })
    }
}

/// Body of a `TX_REQUEST` message.
///
/// The transmit vector is an opaque blob carried verbatim between stub and
/// processor; the core never inspects it.
#[derive(Clone, Debug, PartialEq)]
pub struct TxRequestBody {
    pub device_id: DeviceId,
    pub phy_id: u32,
    /// Transmit power as integer picowatts.
    pub tx_power_pw: u64,
    pub payload: Bytes,
    pub tx_vector: Bytes,
}

impl TxRequestBody {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.device_id);
        buf.put_u32(self.phy_id);
        buf.put_u64(self.tx_power_pw);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(self.tx_vector.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.tx_vector);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, 4 + 4 + 8 + 4 + 4)?;
        let device_id = buf.get_u32();
        let phy_id = buf.get_u32();
        let tx_power_pw = buf.get_u64();
        let payload_len = buf.get_u32() as usize;
        let tx_vector_len = buf.get_u32() as usize;
        need(buf, payload_len + tx_vector_len)?;
        let payload = buf.copy_to_bytes(payload_len);
        let tx_vector = buf.copy_to_bytes(tx_vector_len);
        Ok(Self {
            device_id,
            phy_id,
            tx_power_pw,
            payload,
            tx_vector,
        })
    }
}

/// Body of an `RX_NOTIFICATION` message.
#[derive(Clone, Debug, PartialEq)]
pub struct RxNotificationBody {
    pub receiver_device_id: DeviceId,
    pub transmitter_device_id: DeviceId,
    pub phy_id: u32,
    /// Received power as integer picowatts (exact).
    pub rx_power_pw: u64,
    /// Received power in dBm; informational.
    pub rx_power_dbm: f64,
    /// Path loss in dB; informational.
    pub path_loss_db: f64,
    /// Transmitter–receiver distance in meters; informational.
    pub distance_m: f64,
    pub frequency_hz: u32,
    pub propagation_delay_ns: u64,
    /// Simulation time the transmission started.
    pub tx_timestamp_ns: SimTime,
    pub payload: Bytes,
}

impl RxNotificationBody {
    /// Reception start time: transmission timestamp plus propagation delay,
    /// exact in integer nanoseconds.
    pub fn reception_timestamp(&self) -> SimTime {
        self.tx_timestamp_ns + self.propagation_delay_ns
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.receiver_device_id);
        buf.put_u32(self.transmitter_device_id);
        buf.put_u32(self.phy_id);
        buf.put_u64(self.rx_power_pw);
        buf.put_f64(self.rx_power_dbm);
        buf.put_f64(self.path_loss_db);
        buf.put_f64(self.distance_m);
        buf.put_u32(self.frequency_hz);
        buf.put_u64(self.propagation_delay_ns);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u64(self.tx_timestamp_ns);
        buf.put_slice(&self.payload);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, 4 * 3 + 8 + 8 * 3 + 4 + 8 + 4 + 8)?;
        let receiver_device_id = buf.get_u32();
        let transmitter_device_id = buf.get_u32();
        let phy_id = buf.get_u32();
        let rx_power_pw = buf.get_u64();
        let rx_power_dbm = buf.get_f64();
        let path_loss_db = buf.get_f64();
        let distance_m = buf.get_f64();
        let frequency_hz = buf.get_u32();
        let propagation_delay_ns = buf.get_u64();
        let payload_len = buf.get_u32() as usize;
        let tx_timestamp_ns = buf.get_u64();
        need(buf, payload_len)?;
        let payload = buf.copy_to_bytes(payload_len);
        Ok(Self {
            receiver_device_id,
            transmitter_device_id,
            phy_id,
            rx_power_pw,
            rx_power_dbm,
            path_loss_db,
            distance_m,
            frequency_hz,
            propagation_delay_ns,
            tx_timestamp_ns,
            payload,
        })
    }
}

/// Which model a `CONFIG_*` message replaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ConfigTarget {
    DelayModel = 0,
    LossModel = 1,
}

/// Body of a `CONFIG_LOSS_MODEL` / `CONFIG_DELAY_MODEL` message.
///
/// The parameter blob format is defined by the chosen model and is opaque
/// to the core.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigBody {
    pub target: ConfigTarget,
    /// Hash of the model type name (see [`crate::models::model_type_hash`]).
    pub model_type_hash: u32,
    pub params: Bytes,
}

impl ConfigBody {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.target as u32);
        buf.put_u32(self.model_type_hash);
        buf.put_u32(self.params.len() as u32);
        buf.put_slice(&self.params);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, 12)?;
        let target = match buf.get_u32() {
            0 => ConfigTarget::DelayModel,
            1 => ConfigTarget::LossModel,
            other => return Err(WireError::UnknownConfigTarget(other)),
        };
        let model_type_hash = buf.get_u32();
        let params_len = buf.get_u32() as usize;
        need(buf, params_len)?;
        let params = buf.copy_to_bytes(params_len);
        Ok(Self {
            target,
            model_type_hash,
            params,
        })
    }
}

/// Body of a `CONFIG_ACK` message.
///
/// Echoes the sequence number of the operation being acknowledged; for
/// registration acks, `device_id` carries the id the channel processor
/// assigned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigAckBody {
    pub device_id: DeviceId,
    pub context_sequence: SequenceNumber,
}

impl ConfigAckBody {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.device_id);
        buf.put_u32(self.context_sequence);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, 8)?;
        Ok(Self {
            device_id: buf.get_u32(),
            context_sequence: buf.get_u32(),
        })
    }
}

/// Body of an `ERROR_NOTIFY` message.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorNotifyBody {
    /// Numeric error kind (see [`crate::error::ErrorKind::code`]).
    pub error_kind: u32,
    /// Sequence number of the message that triggered the error.
    pub context_sequence: SequenceNumber,
    pub message: Bytes,
}

impl ErrorNotifyBody {
    /// The diagnostic text, lossily decoded.
    pub fn message_text(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.error_kind);
        buf.put_u32(self.context_sequence);
        buf.put_u32(self.message.len() as u32);
        buf.put_slice(&self.message);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(buf, 12)?;
        let error_kind = buf.get_u32();
        let context_sequence = buf.get_u32();
        let message_len = buf.get_u32() as usize;
        need(buf, message_len)?;
        let message = buf.copy_to_bytes(message_len);
        Ok(Self {
            error_kind,
            context_sequence,
            message,
        })
    }
}

/// A type-specific message body.
///
/// `DEVICE_REMOVE`, `TX_START_NOTIFY`, `TX_END_NOTIFY`, and `HEARTBEAT`
/// carry no body; the device id they concern travels in the header.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    DeviceRegister(DeviceRegisterBody),
    PositionUpdate(PositionUpdateBody),
    TxRequest(TxRequestBody),
    RxNotification(RxNotificationBody),
    Config(ConfigBody),
    ConfigAck(ConfigAckBody),
    ErrorNotify(ErrorNotifyBody),
    Empty,
}

impl Body {
    /// The message type this body is carried under.
    ///
    /// `Config` maps to the loss or delay variant via its target field;
    /// `Empty` has no inherent type and is resolved by the caller.
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Body::DeviceRegister(_) => Some(MessageType::DeviceRegister),
            Body::PositionUpdate(_) => Some(MessageType::PositionUpdate),
            Body::TxRequest(_) => Some(MessageType::TxRequest),
            Body::RxNotification(_) => Some(MessageType::RxNotification),
            Body::Config(c) => Some(match c.target {
                ConfigTarget::DelayModel => MessageType::ConfigDelayModel,
                ConfigTarget::LossModel => MessageType::ConfigLossModel,
            }),
            Body::ConfigAck(_) => Some(MessageType::ConfigAck),
            Body::ErrorNotify(_) => Some(MessageType::ErrorNotify),
            Body::Empty => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Body::DeviceRegister(b) => b.encode(buf),
            Body::PositionUpdate(b) => b.encode(buf),
            Body::TxRequest(b) => b.encode(buf),
            Body::RxNotification(b) => b.encode(buf),
            Body::Config(b) => b.encode(buf),
            Body::ConfigAck(b) => b.encode(buf),
            Body::ErrorNotify(b) => b.encode(buf),
            Body::Empty => {}
        }
    }

    fn decode(message_type: MessageType, buf: &mut impl Buf) -> Result<Self, WireError> {
        match message_type {
            MessageType::DeviceRegister => {
                Ok(Body::DeviceRegister(DeviceRegisterBody::decode(buf)?))
            }
            MessageType::PositionUpdate => {
                Ok(Body::PositionUpdate(PositionUpdateBody::decode(buf)?))
            }
            MessageType::TxRequest => Ok(Body::TxRequest(TxRequestBody::decode(buf)?)),
            MessageType::RxNotification => {
                Ok(Body::RxNotification(RxNotificationBody::decode(buf)?))
            }
            MessageType::ConfigDelayModel | MessageType::ConfigLossModel => {
                Ok(Body::Config(ConfigBody::decode(buf)?))
            }
            MessageType::ConfigAck => Ok(Body::ConfigAck(ConfigAckBody::decode(buf)?)),
            MessageType::ErrorNotify => Ok(Body::ErrorNotify(ErrorNotifyBody::decode(buf)?)),
            MessageType::DeviceRemove
            | MessageType::TxStartNotify
            | MessageType::TxEndNotify
            | MessageType::Heartbeat => Ok(Body::Empty),
        }
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

/// A complete framed message: header plus type-specific body.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    /// Serializes this message into a single contiguous buffer.
    ///
    /// `total_length` and `body_checksum` in the emitted header are computed
    /// here; the values in `self.header` are ignored for those two fields.
    /// Pass `with_checksum = false` to emit 0 (verification disabled).
    pub fn encode(&self, with_checksum: bool) -> Result<Bytes, WireError> {
        let mut body_buf = BytesMut::new();
        self.body.encode(&mut body_buf);
        if HEADER_LEN + body_buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::BodyTooLarge(body_buf.len()));
        }

        let checksum = if with_checksum {
            body_checksum(&body_buf)
        } else {
            0
        };

        let mut header = self.header.clone();
        header.total_length = (HEADER_LEN + body_buf.len()) as u32;
        header.body_checksum = checksum;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_buf.len());
        header.encode(&mut buf);
        buf.put_slice(&body_buf);
        Ok(buf.freeze())
    }

    /// Parses a message from a single framed buffer.
    ///
    /// Verifies the declared length against the framed size and, when the
    /// header carries a non-zero checksum, the body checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = bytes;
        let header = Header::decode(&mut buf)?;

        if header.total_length as usize != bytes.len() {
            return Err(WireError::LengthMismatch {
                declared: header.total_length,
                framed: bytes.len(),
            });
        }

        if header.body_checksum != 0 {
            let computed = body_checksum(buf);
            if computed != header.body_checksum {
                return Err(WireError::ChecksumMismatch {
                    expected: header.body_checksum,
                    computed,
                });
            }
        }

        let body = Body::decode(header.message_type, &mut buf)?;
        Ok(Self { header, body })
    }
}
