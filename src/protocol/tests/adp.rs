use std::time::Duration;

use super::sample_info;
use crate::protocol::adp::*;
use crate::protocol::{ControlPdu, PduError};
use crate::types::EntityId;

#[test]
fn test_message_type_from_nibble() {
    assert_eq!(
        AdpMessageType::from_nibble(0).unwrap(),
        AdpMessageType::EntityAvailable
    );
    assert_eq!(
        AdpMessageType::from_nibble(1).unwrap(),
        AdpMessageType::EntityDeparting
    );
    assert_eq!(
        AdpMessageType::from_nibble(2).unwrap(),
        AdpMessageType::EntityDiscover
    );
    assert!(AdpMessageType::from_nibble(3).is_err());
}

#[test]
fn test_available_layout() {
    let pdu = AdpPdu {
        message_type: AdpMessageType::EntityAvailable,
        info: sample_info(),
    };
    let bytes = pdu.encode();

    assert_eq!(bytes.len(), AdpPdu::SIZE);
    assert_eq!(bytes[0], 0xFA);
    assert_eq!(bytes[1], 0x00);
    // valid_time 10s -> 5 in the status bits, control_data_length 56
    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), (5 << 11) | 56);
    assert_eq!(&bytes[4..12], &0x0011_22ff_fe33_4455u64.to_be_bytes());
    // available_index sits after model id, capabilities and stream counts
    assert_eq!(&bytes[12 + 24..12 + 28], &5u32.to_be_bytes());
    assert_eq!(bytes[12 + 36], 0);
}

#[test]
fn test_available_decode_matches_encode() {
    let pdu = AdpPdu {
        message_type: AdpMessageType::EntityAvailable,
        info: sample_info(),
    };
    let decoded = AdpPdu::decode(&pdu.encode()).unwrap();
    assert_eq!(decoded, pdu);
    assert!(decoded.info.is_talker());
    assert!(decoded.info.is_listener());
    assert!(!decoded.info.is_controller());
}

#[test]
fn test_discover_has_zero_status() {
    let bytes = AdpPdu::discover(EntityId::NONE).encode();
    assert_eq!(bytes[1] & 0x0F, 2);
    assert_eq!(bytes[2] >> 3, 0);

    match ControlPdu::decode(&bytes).unwrap() {
        ControlPdu::Adp(pdu) => {
            assert_eq!(pdu.message_type, AdpMessageType::EntityDiscover);
            assert_eq!(pdu.info.entity_id, EntityId::NONE);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_valid_time_encoding() {
    assert_eq!(AdpPdu::encode_valid_time(Duration::from_secs(62)), 31);
    assert_eq!(AdpPdu::encode_valid_time(Duration::from_secs(10)), 5);
    assert_eq!(AdpPdu::encode_valid_time(Duration::from_secs(600)), 31);
    assert_eq!(AdpPdu::decode_valid_time(5), Duration::from_secs(10));
    assert_eq!(AdpPdu::decode_valid_time(0), Duration::from_secs(1));
}

#[test]
fn test_short_body_rejected() {
    let mut bytes = AdpPdu {
        message_type: AdpMessageType::EntityAvailable,
        info: sample_info(),
    }
    .encode()
    .to_vec();
    // Declare 40 bytes of body instead of 56
    bytes[3] = 40;
    assert!(matches!(
        AdpPdu::decode(&bytes),
        Err(PduError::TooShort { needed: 56, have: 40 })
    ));
}
