//! ADP (discovery) PDU.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::PduError;
use super::avtp::{ControlHeader, Subtype, require_len};
use crate::types::{
    ControllerCapabilities, EntityCapabilities, EntityId, EntityInfo, ListenerCapabilities,
    TalkerCapabilities,
};

/// ADP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdpMessageType {
    /// Entity is present
    EntityAvailable = 0,
    /// Entity is leaving
    EntityDeparting = 1,
    /// Request advertisements
    EntityDiscover = 2,
}

impl AdpMessageType {
    /// Parse from the 4-bit header field
    ///
    /// # Errors
    ///
    /// Returns `PduError::UnknownMessageType` for undefined values.
    pub fn from_nibble(value: u8) -> Result<Self, PduError> {
        match value & 0x0F {
            0 => Ok(Self::EntityAvailable),
            1 => Ok(Self::EntityDeparting),
            2 => Ok(Self::EntityDiscover),
            other => Err(PduError::UnknownMessageType {
                protocol: Subtype::Adp,
                value: other,
            }),
        }
    }
}

impl std::fmt::Display for AdpMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntityAvailable => write!(f, "ENTITY_AVAILABLE"),
            Self::EntityDeparting => write!(f, "ENTITY_DEPARTING"),
            Self::EntityDiscover => write!(f, "ENTITY_DISCOVER"),
        }
    }
}

/// ADP PDU: a message type plus the advertised entity information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdpPdu {
    /// Message type
    pub message_type: AdpMessageType,
    /// Advertised information. Only `entity_id` is meaningful in DISCOVER.
    pub info: EntityInfo,
}

impl AdpPdu {
    /// `control_data_length` of every ADP PDU
    pub const CONTROL_DATA_LENGTH: usize = 56;

    /// Full PDU size including the control header
    pub const SIZE: usize = ControlHeader::SIZE + Self::CONTROL_DATA_LENGTH;

    /// DISCOVER for one entity, or for all with `EntityId::NONE`
    #[must_use]
    pub fn discover(entity_id: EntityId) -> Self {
        Self {
            message_type: AdpMessageType::EntityDiscover,
            info: EntityInfo {
                entity_id,
                entity_model_id: 0,
                entity_capabilities: EntityCapabilities::NONE,
                talker_stream_sources: 0,
                talker_capabilities: TalkerCapabilities::NONE,
                listener_stream_sinks: 0,
                listener_capabilities: ListenerCapabilities::NONE,
                controller_capabilities: ControllerCapabilities::NONE,
                available_index: 0,
                gptp_grandmaster_id: 0,
                gptp_domain_number: 0,
                identify_control_index: 0,
                interface_index: 0,
                association_id: 0,
                valid_time: Duration::ZERO,
            },
        }
    }

    /// Encode `valid_time` into the 5-bit status field (units of 2 seconds)
    #[must_use]
    pub fn encode_valid_time(valid_time: Duration) -> u8 {
        u8::try_from(valid_time.as_secs() / 2)
            .unwrap_or(31)
            .min(31)
    }

    /// Decode the 5-bit status field; zero is read as one second
    #[must_use]
    pub fn decode_valid_time(status: u8) -> Duration {
        Duration::from_secs(u64::from(status & 0x1F).saturating_mul(2).max(1))
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let info = &self.info;
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        ControlHeader {
            subtype: Subtype::Adp,
            message_type: self.message_type as u8,
            status: Self::encode_valid_time(info.valid_time),
            control_data_length: Self::CONTROL_DATA_LENGTH as u16,
            id: info.entity_id.0,
        }
        .encode(&mut buf);
        buf.put_u64(info.entity_model_id);
        buf.put_u32(info.entity_capabilities.bits());
        buf.put_u16(info.talker_stream_sources);
        buf.put_u16(info.talker_capabilities.bits());
        buf.put_u16(info.listener_stream_sinks);
        buf.put_u16(info.listener_capabilities.bits());
        buf.put_u32(info.controller_capabilities.bits());
        buf.put_u32(info.available_index);
        buf.put_u64(info.gptp_grandmaster_id);
        buf.put_u8(info.gptp_domain_number);
        buf.put_bytes(0, 3);
        buf.put_u16(info.identify_control_index);
        buf.put_u16(info.interface_index);
        buf.put_u64(info.association_id);
        buf.put_u32(0);
        buf.freeze()
    }

    /// Decode the body of an ADP PDU whose header was already parsed
    ///
    /// # Errors
    ///
    /// Fails on an unknown message type or a body shorter than 56 bytes.
    pub fn decode_body(header: &ControlHeader, body: &[u8]) -> Result<Self, PduError> {
        let message_type = AdpMessageType::from_nibble(header.message_type)?;
        require_len(body, Self::CONTROL_DATA_LENGTH)?;
        let mut b = body;
        let entity_model_id = b.get_u64();
        let entity_capabilities = EntityCapabilities(b.get_u32());
        let talker_stream_sources = b.get_u16();
        let talker_capabilities = TalkerCapabilities(b.get_u16());
        let listener_stream_sinks = b.get_u16();
        let listener_capabilities = ListenerCapabilities(b.get_u16());
        let controller_capabilities = ControllerCapabilities(b.get_u32());
        let available_index = b.get_u32();
        let gptp_grandmaster_id = b.get_u64();
        let gptp_domain_number = b.get_u8();
        b.advance(3);
        let identify_control_index = b.get_u16();
        let interface_index = b.get_u16();
        let association_id = b.get_u64();

        Ok(Self {
            message_type,
            info: EntityInfo {
                entity_id: EntityId(header.id),
                entity_model_id,
                entity_capabilities,
                talker_stream_sources,
                talker_capabilities,
                listener_stream_sinks,
                listener_capabilities,
                controller_capabilities,
                available_index,
                gptp_grandmaster_id,
                gptp_domain_number,
                identify_control_index,
                interface_index,
                association_id,
                valid_time: Self::decode_valid_time(header.status),
            },
        })
    }

    /// Decode a complete ADP PDU
    ///
    /// # Errors
    ///
    /// Fails if the header is invalid, the subtype is not ADP, or the body is
    /// malformed.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        let (header, body) = ControlHeader::decode(data)?;
        if header.subtype != Subtype::Adp {
            return Err(PduError::UnknownSubtype(header.subtype as u8));
        }
        Self::decode_body(&header, body)
    }
}
