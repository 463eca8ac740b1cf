use proptest::prelude::*;

use crate::protocol::aem::Descriptor;
use crate::protocol::{AcmpPdu, AecpPdu, ControlPdu};

proptest! {
    #[test]
    fn test_control_pdu_decode_any_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..600)) {
        // Should not panic, return either Ok or Err
        let _ = ControlPdu::decode(&bytes);
    }

    #[test]
    fn test_control_pdu_decode_with_valid_subtype(
        subtype in 0xFAu8..=0xFC,
        rest in proptest::collection::vec(any::<u8>(), 0..600)
    ) {
        let mut bytes = vec![subtype];
        bytes.extend_from_slice(&rest);
        let _ = ControlPdu::decode(&bytes);
    }

    #[test]
    fn test_descriptor_decode_any_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..400)) {
        let _ = Descriptor::decode(&bytes);
    }

    #[test]
    fn test_decoded_pdu_reencodes_identically(
        subtype in 0xFAu8..=0xFC,
        rest in proptest::collection::vec(any::<u8>(), 11..200)
    ) {
        let mut bytes = vec![subtype];
        bytes.extend_from_slice(&rest);
        if let Ok(pdu) = ControlPdu::decode(&bytes) {
            // Re-encoding a decoded PDU must decode to the same value
            let again = ControlPdu::decode(&pdu.encode()).expect("re-decode failed");
            prop_assert_eq!(again, pdu);
        }
    }

    #[test]
    fn test_acmp_sequence_id_preserved(seq in any::<u16>(), uid in any::<u16>()) {
        let mut pdu = AcmpPdu::command(
            crate::protocol::AcmpMessageType::ConnectRxCommand,
            crate::types::EntityId(1),
            (crate::types::EntityId(2), uid),
            (crate::types::EntityId(3), uid.wrapping_add(1)),
        );
        pdu.sequence_id = seq;
        let decoded = AcmpPdu::decode(&pdu.encode()).expect("decode failed");
        prop_assert_eq!(decoded.sequence_id, seq);
        prop_assert_eq!(decoded.talker_unique_id, uid);
    }

    #[test]
    fn test_aecp_payload_preserved(payload in proptest::collection::vec(any::<u8>(), 0..200)) {
        let pdu = AecpPdu::aem_command(
            crate::types::EntityId(1),
            crate::types::EntityId(2),
            crate::protocol::AemCommandType::SET_CONTROL,
            bytes::Bytes::from(payload.clone()),
        );
        let decoded = AecpPdu::decode(&pdu.encode()).expect("decode failed");
        prop_assert_eq!(&decoded.body.payload()[..], &payload[..]);
    }
}
