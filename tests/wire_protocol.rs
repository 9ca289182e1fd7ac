//! Tests for the wire protocol.
//!
//! These tests verify:
//! - Serialize-then-parse is the identity for every defined message body
//! - The documented header layout and canonical units
//! - Frame validation: length bounds, version, checksum, unknown types

use bytes::Bytes;

use airwave::types::{dbm_to_watts, watts_to_picowatts, Position};
use airwave::wire::{
    body_checksum, Body, ConfigAckBody, ConfigBody, ConfigTarget, DeviceRegisterBody,
    ErrorNotifyBody, Header, Message, MessageType, PositionUpdateBody, RxNotificationBody,
    TxRequestBody, WireError, HEADER_LEN, HEADER_VERSION, MAX_MESSAGE_SIZE,
};

fn header(message_type: MessageType, sequence: u32, device_id: u32) -> Header {
    Header {
        message_type,
        total_length: 0,
        source_rank: 1,
        destination_rank: 0,
        timestamp_ns: 123_456_789,
        sequence,
        device_id,
        reserved: 0,
        header_version: HEADER_VERSION,
        body_checksum: 0,
    }
}

fn round_trip(message: &Message) -> Message {
    let bytes = message.encode(true).unwrap();
    Message::decode(&bytes).unwrap()
}

// ============================================================================
// Round-trip laws
// ============================================================================

#[test]
fn test_every_body_round_trips() {
    let bodies = vec![
        Body::DeviceRegister(DeviceRegisterBody {
            phy_id: 2,
            phy_type: 0xCAFE_F00D,
            channel_number: 36,
            channel_width_mhz: 40,
            node_id: 17,
            position: Position::new(-3.25, 14.5, 2.0),
        }),
        Body::PositionUpdate(PositionUpdateBody {
            device_id: 5,
            position: Position::new(100.0, -50.0, 1.5),
            velocity: 3.5,
            heading: 270.0,
        }),
        Body::TxRequest(TxRequestBody {
            device_id: 5,
            phy_id: 2,
            tx_power_pw: watts_to_picowatts(dbm_to_watts(16.0)),
            payload: Bytes::from(vec![0xAB; 1500]),
            tx_vector: Bytes::from(vec![0x01, 0x02, 0x03, 0x04]),
        }),
        Body::RxNotification(RxNotificationBody {
            receiver_device_id: 9,
            transmitter_device_id: 5,
            phy_id: 0,
            rx_power_pw: 12_345,
            rx_power_dbm: -79.08,
            path_loss_db: 95.08,
            distance_m: 412.7,
            frequency_hz: 2_462_000_000,
            propagation_delay_ns: 1_377,
            tx_timestamp_ns: 2_000_000,
            payload: Bytes::from(vec![0xCD; 64]),
        }),
        Body::Config(ConfigBody {
            target: ConfigTarget::DelayModel,
            model_type_hash: 0x0102_0304,
            params: Bytes::from(vec![9u8; 24]),
        }),
        Body::ConfigAck(ConfigAckBody {
            device_id: 9,
            context_sequence: 41,
        }),
        Body::ErrorNotify(ErrorNotifyBody {
            error_kind: 4,
            context_sequence: 7,
            message: Bytes::from_static(b"model evaluation failed"),
        }),
    ];

    for body in bodies {
        let message_type = body.message_type().unwrap();
        let message = Message {
            header: header(message_type, 3, 5),
            body,
        };
        let decoded = round_trip(&message);
        assert_eq!(decoded.body, message.body, "{}", message_type.name());
        assert_eq!(decoded.header.message_type, message_type);
        assert_eq!(decoded.header.timestamp_ns, 123_456_789);
        assert_eq!(decoded.header.sequence, 3);
    }
}

#[test]
fn test_empty_payloads_round_trip() {
    let message = Message {
        header: header(MessageType::TxRequest, 1, 5),
        body: Body::TxRequest(TxRequestBody {
            device_id: 5,
            phy_id: 0,
            tx_power_pw: 0,
            payload: Bytes::new(),
            tx_vector: Bytes::new(),
        }),
    };
    let decoded = round_trip(&message);
    match decoded.body {
        Body::TxRequest(tx) => {
            assert!(tx.payload.is_empty());
            assert!(tx.tx_vector.is_empty());
        }
        other => panic!("expected TxRequest, got {other:?}"),
    }
}

#[test]
fn test_header_only_types_round_trip() {
    for message_type in [
        MessageType::DeviceRemove,
        MessageType::TxStartNotify,
        MessageType::TxEndNotify,
        MessageType::Heartbeat,
    ] {
        let message = Message {
            header: header(message_type, 2, 8),
            body: Body::Empty,
        };
        let bytes = message.encode(true).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.header.device_id, 8);
        assert_eq!(decoded.body, Body::Empty);
    }
}

// ============================================================================
// Documented layout
// ============================================================================

#[test]
fn test_header_byte_layout() {
    let message = Message {
        header: Header {
            message_type: MessageType::TxRequest,
            total_length: 0,
            source_rank: 0x0000_0001,
            destination_rank: 0x0000_0002,
            timestamp_ns: 0x0102_0304_0506_0708,
            sequence: 0x0A0B_0C0D,
            device_id: 0x1122_3344,
            reserved: 0,
            header_version: HEADER_VERSION,
            body_checksum: 0,
        },
        body: Body::TxRequest(TxRequestBody {
            device_id: 0x1122_3344,
            phy_id: 0,
            tx_power_pw: 0,
            payload: Bytes::new(),
            tx_vector: Bytes::new(),
        }),
    };
    let bytes = message.encode(false).unwrap();

    // Offsets from the wire contract: type, length, ranks, timestamp,
    // sequence, device id, reserved, version, checksum.
    assert_eq!(&bytes[0..4], &103u32.to_be_bytes());
    assert_eq!(&bytes[4..8], &(bytes.len() as u32).to_be_bytes());
    assert_eq!(&bytes[8..12], &1u32.to_be_bytes());
    assert_eq!(&bytes[12..16], &2u32.to_be_bytes());
    assert_eq!(&bytes[16..24], &0x0102_0304_0506_0708u64.to_be_bytes());
    assert_eq!(&bytes[24..28], &0x0A0B_0C0Du32.to_be_bytes());
    assert_eq!(&bytes[28..32], &0x1122_3344u32.to_be_bytes());
    assert_eq!(&bytes[32..36], &0u32.to_be_bytes());
    assert_eq!(&bytes[36..40], &1u32.to_be_bytes());
    assert_eq!(&bytes[40..44], &0u32.to_be_bytes());
}

#[test]
fn test_power_travels_as_integer_picowatts() {
    // 20 dBm == 100 mW == 10^11 pW, exact on the wire.
    let pw = watts_to_picowatts(dbm_to_watts(20.0));
    assert_eq!(pw, 100_000_000_000);

    let message = Message {
        header: header(MessageType::TxRequest, 1, 1),
        body: Body::TxRequest(TxRequestBody {
            device_id: 1,
            phy_id: 0,
            tx_power_pw: pw,
            payload: Bytes::new(),
            tx_vector: Bytes::new(),
        }),
    };
    match round_trip(&message).body {
        Body::TxRequest(tx) => assert_eq!(tx.tx_power_pw, 100_000_000_000),
        other => panic!("expected TxRequest, got {other:?}"),
    }
}

#[test]
fn test_reception_timestamp_is_exact_integer_sum() {
    let body = RxNotificationBody {
        receiver_device_id: 2,
        transmitter_device_id: 1,
        phy_id: 0,
        rx_power_pw: 1,
        rx_power_dbm: -90.0,
        path_loss_db: 110.0,
        distance_m: 1.0,
        frequency_hz: 2_412_000_000,
        propagation_delay_ns: 33,
        tx_timestamp_ns: u64::MAX - 1_000,
        payload: Bytes::new(),
    };
    // Exact in the canonical integer nanosecond encoding, even near the
    // top of the range.
    assert_eq!(body.reception_timestamp(), u64::MAX - 1_000 + 33);
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_corrupted_body_rejected_by_checksum() {
    let message = Message {
        header: header(MessageType::PositionUpdate, 1, 5),
        body: Body::PositionUpdate(PositionUpdateBody {
            device_id: 5,
            position: Position::new(1.0, 2.0, 3.0),
            velocity: 0.0,
            heading: 0.0,
        }),
    };
    let mut bytes = message.encode(true).unwrap().to_vec();
    bytes[HEADER_LEN + 5] ^= 0x40;
    assert!(matches!(
        Message::decode(&bytes),
        Err(WireError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_declared_length_must_match_frame() {
    let message = Message {
        header: header(MessageType::Heartbeat, 1, 0),
        body: Body::Empty,
    };
    let mut bytes = message.encode(false).unwrap().to_vec();

    // Claim a longer message than was framed.
    bytes[4..8].copy_from_slice(&(HEADER_LEN as u32 + 100).to_be_bytes());
    assert!(matches!(
        Message::decode(&bytes),
        Err(WireError::LengthMismatch { .. })
    ));

    // Claim a length outside the permitted window.
    bytes[4..8].copy_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
    assert!(matches!(
        Message::decode(&bytes),
        Err(WireError::LengthOutOfRange(_))
    ));
}

#[test]
fn test_truncated_variable_section_rejected() {
    let message = Message {
        header: header(MessageType::TxRequest, 1, 5),
        body: Body::TxRequest(TxRequestBody {
            device_id: 5,
            phy_id: 0,
            tx_power_pw: 7,
            payload: Bytes::from_static(b"0123456789"),
            tx_vector: Bytes::new(),
        }),
    };
    let full = message.encode(false).unwrap();

    // Cut into the payload but fix up the declared length so framing
    // passes; the body decoder must still notice.
    let cut = full.len() - 4;
    let mut bytes = full[..cut].to_vec();
    bytes[4..8].copy_from_slice(&(cut as u32).to_be_bytes());
    assert!(matches!(
        Message::decode(&bytes),
        Err(WireError::Truncated { .. })
    ));
}

#[test]
fn test_oversized_body_refused_at_encode() {
    let message = Message {
        header: header(MessageType::TxRequest, 1, 5),
        body: Body::TxRequest(TxRequestBody {
            device_id: 5,
            phy_id: 0,
            tx_power_pw: 0,
            payload: Bytes::from(vec![0u8; MAX_MESSAGE_SIZE]),
            tx_vector: Bytes::new(),
        }),
    };
    assert!(matches!(
        message.encode(true),
        Err(WireError::BodyTooLarge(_))
    ));
}

#[test]
fn test_checksum_is_order_sensitive_xor_fold() {
    let a = body_checksum(b"\x01\x00\x00\x00\x02\x00\x00\x00");
    let b = body_checksum(b"\x02\x00\x00\x00\x01\x00\x00\x00");
    // xor is commutative over whole words, so word swaps collide; byte
    // moves across word boundaries do not.
    assert_eq!(a, b);
    let c = body_checksum(b"\x00\x01\x00\x00\x02\x00\x00\x00");
    assert_ne!(a, c);
}

#[test]
fn test_message_type_numbering() {
    assert_eq!(MessageType::DeviceRegister as u32, 100);
    assert_eq!(MessageType::ConfigDelayModel as u32, 101);
    assert_eq!(MessageType::ConfigLossModel as u32, 102);
    assert_eq!(MessageType::TxRequest as u32, 103);
    assert_eq!(MessageType::DeviceRemove as u32, 104);
    assert_eq!(MessageType::PositionUpdate as u32, 105);
    assert_eq!(MessageType::RxNotification as u32, 200);
    assert_eq!(MessageType::TxStartNotify as u32, 201);
    assert_eq!(MessageType::TxEndNotify as u32, 202);
    assert_eq!(MessageType::ConfigAck as u32, 203);
    assert_eq!(MessageType::ErrorNotify as u32, 204);
    assert_eq!(MessageType::Heartbeat as u32, 301);
}
