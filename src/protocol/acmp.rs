//! ACMP (connection management) PDU.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::PduError;
use super::avtp::{ControlHeader, Subtype, require_len};
use crate::types::{EntityId, MacAddress, StreamId};

/// ACMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AcmpMessageType {
    /// Controller/listener asks the talker to add a listener
    ConnectTxCommand = 0,
    /// Talker answer to `ConnectTxCommand`
    ConnectTxResponse = 1,
    /// Listener asks the talker to drop a listener
    DisconnectTxCommand = 2,
    /// Talker answer to `DisconnectTxCommand`
    DisconnectTxResponse = 3,
    /// Query talker stream state
    GetTxStateCommand = 4,
    /// Talker stream state
    GetTxStateResponse = 5,
    /// Controller asks a listener to connect
    ConnectRxCommand = 6,
    /// Listener answer to `ConnectRxCommand`
    ConnectRxResponse = 7,
    /// Controller asks a listener to disconnect
    DisconnectRxCommand = 8,
    /// Listener answer to `DisconnectRxCommand`
    DisconnectRxResponse = 9,
    /// Query listener stream state
    GetRxStateCommand = 10,
    /// Listener stream state
    GetRxStateResponse = 11,
    /// Query one listener connected to a talker stream
    GetTxConnectionCommand = 12,
    /// Talker connection entry
    GetTxConnectionResponse = 13,
}

impl AcmpMessageType {
    /// Parse from the 4-bit header field
    ///
    /// # Errors
    ///
    /// Returns `PduError::UnknownMessageType` for 14 and 15.
    pub fn from_nibble(value: u8) -> Result<Self, PduError> {
        Ok(match value & 0x0F {
            0 => Self::ConnectTxCommand,
            1 => Self::ConnectTxResponse,
            2 => Self::DisconnectTxCommand,
            3 => Self::DisconnectTxResponse,
            4 => Self::GetTxStateCommand,
            5 => Self::GetTxStateResponse,
            6 => Self::ConnectRxCommand,
            7 => Self::ConnectRxResponse,
            8 => Self::DisconnectRxCommand,
            9 => Self::DisconnectRxResponse,
            10 => Self::GetRxStateCommand,
            11 => Self::GetRxStateResponse,
            12 => Self::GetTxConnectionCommand,
            13 => Self::GetTxConnectionResponse,
            other => {
                return Err(PduError::UnknownMessageType {
                    protocol: Subtype::Acmp,
                    value: other,
                });
            }
        })
    }

    /// Commands have even values
    #[must_use]
    pub fn is_command(self) -> bool {
        (self as u8) & 1 == 0
    }

    /// Response type matching a command (identity for responses)
    #[must_use]
    pub fn response(self) -> Self {
        Self::from_nibble((self as u8) | 1).unwrap_or(self)
    }

    /// Command type matching a response (identity for commands)
    #[must_use]
    pub fn command(self) -> Self {
        Self::from_nibble((self as u8) & !1).unwrap_or(self)
    }

    /// Time to wait for the response to this command
    #[must_use]
    pub fn timeout(self) -> Duration {
        match self.command() {
            Self::ConnectTxCommand => Duration::from_millis(2000),
            Self::ConnectRxCommand => Duration::from_millis(4500),
            Self::DisconnectRxCommand => Duration::from_millis(500),
            _ => Duration::from_millis(200),
        }
    }
}

impl std::fmt::Display for AcmpMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConnectTxCommand => "CONNECT_TX_COMMAND",
            Self::ConnectTxResponse => "CONNECT_TX_RESPONSE",
            Self::DisconnectTxCommand => "DISCONNECT_TX_COMMAND",
            Self::DisconnectTxResponse => "DISCONNECT_TX_RESPONSE",
            Self::GetTxStateCommand => "GET_TX_STATE_COMMAND",
            Self::GetTxStateResponse => "GET_TX_STATE_RESPONSE",
            Self::ConnectRxCommand => "CONNECT_RX_COMMAND",
            Self::ConnectRxResponse => "CONNECT_RX_RESPONSE",
            Self::DisconnectRxCommand => "DISCONNECT_RX_COMMAND",
            Self::DisconnectRxResponse => "DISCONNECT_RX_RESPONSE",
            Self::GetRxStateCommand => "GET_RX_STATE_COMMAND",
            Self::GetRxStateResponse => "GET_RX_STATE_RESPONSE",
            Self::GetTxConnectionCommand => "GET_TX_CONNECTION_COMMAND",
            Self::GetTxConnectionResponse => "GET_TX_CONNECTION_RESPONSE",
        };
        f.write_str(name)
    }
}

/// ACMP status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AcmpStatus {
    /// Command completed
    Success = 0,
    /// Listener does not have the requested unique id
    ListenerUnknownId = 1,
    /// Talker does not have the requested unique id
    TalkerUnknownId = 2,
    /// Talker could not allocate a destination MAC
    TalkerDestMacFail = 3,
    /// Talker has no stream index available
    TalkerNoStreamIndex = 4,
    /// Talker could not reserve bandwidth
    TalkerNoBandwidth = 5,
    /// Talker stream is exclusive and already connected
    TalkerExclusive = 6,
    /// Listener timed out waiting for the talker
    ListenerTalkerTimeout = 7,
    /// Listener is already connected to another talker
    ListenerExclusive = 8,
    /// State is not available
    StateUnavailable = 9,
    /// Listener is not connected
    NotConnected = 10,
    /// Talker has no such connection
    NoSuchConnection = 11,
    /// Message could not be sent
    CouldNotSendMessage = 12,
    /// Talker misbehaved
    TalkerMisbehaving = 13,
    /// Listener misbehaved
    ListenerMisbehaving = 14,
    /// Controller not authorized
    ControllerNotAuthorized = 16,
    /// Request incompatible with the stream
    IncompatibleRequest = 17,
    /// Command not supported
    NotSupported = 31,
}

impl AcmpStatus {
    /// Parse from the 5-bit header field
    ///
    /// # Errors
    ///
    /// Returns `PduError::InvalidField` for reserved values.
    pub fn from_u8(value: u8) -> Result<Self, PduError> {
        Ok(match value {
            0 => Self::Success,
            1 => Self::ListenerUnknownId,
            2 => Self::TalkerUnknownId,
            3 => Self::TalkerDestMacFail,
            4 => Self::TalkerNoStreamIndex,
            5 => Self::TalkerNoBandwidth,
            6 => Self::TalkerExclusive,
            7 => Self::ListenerTalkerTimeout,
            8 => Self::ListenerExclusive,
            9 => Self::StateUnavailable,
            10 => Self::NotConnected,
            11 => Self::NoSuchConnection,
            12 => Self::CouldNotSendMessage,
            13 => Self::TalkerMisbehaving,
            14 => Self::ListenerMisbehaving,
            16 => Self::ControllerNotAuthorized,
            17 => Self::IncompatibleRequest,
            31 => Self::NotSupported,
            other => {
                return Err(PduError::InvalidField {
                    field: "acmp status",
                    value: u64::from(other),
                });
            }
        })
    }

    /// Whether this is `Success`
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for AcmpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// ACMP connection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AcmpFlags(pub u16);

impl AcmpFlags {
    /// SR class B
    pub const CLASS_B: Self = Self(1 << 0);
    /// Fast connect
    pub const FAST_CONNECT: Self = Self(1 << 1);
    /// Connection restored from saved state
    pub const SAVED_STATE: Self = Self(1 << 2);
    /// Do not start streaming on connect
    pub const STREAMING_WAIT: Self = Self(1 << 3);
    /// Encryption supported
    pub const SUPPORTS_ENCRYPTED: Self = Self(1 << 4);
    /// Encrypted PDUs
    pub const ENCRYPTED_PDU: Self = Self(1 << 5);
    /// Talker reported a registration failure
    pub const TALKER_FAILED: Self = Self(1 << 6);

    /// All bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set or clear `other`
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for AcmpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// ACMP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmpPdu {
    /// Message type
    pub message_type: AcmpMessageType,
    /// Status (always `Success` in commands)
    pub status: AcmpStatus,
    /// Stream id
    pub stream_id: StreamId,
    /// Controller that initiated the exchange
    pub controller_entity_id: EntityId,
    /// Talker entity
    pub talker_entity_id: EntityId,
    /// Listener entity
    pub listener_entity_id: EntityId,
    /// Talker stream index
    pub talker_unique_id: u16,
    /// Listener stream index
    pub listener_unique_id: u16,
    /// Stream destination MAC
    pub stream_dest_mac: MacAddress,
    /// Number of listeners connected to the talker stream
    pub connection_count: u16,
    /// Sequence id of the originator
    pub sequence_id: u16,
    /// Flags
    pub flags: AcmpFlags,
    /// Stream VLAN
    pub stream_vlan_id: u16,
}

impl AcmpPdu {
    /// `control_data_length` of every ACMP PDU
    pub const CONTROL_DATA_LENGTH: usize = 44;

    /// Full PDU size including the control header
    pub const SIZE: usize = ControlHeader::SIZE + Self::CONTROL_DATA_LENGTH;

    /// A command with every stream field zeroed
    #[must_use]
    pub fn command(
        message_type: AcmpMessageType,
        controller_entity_id: EntityId,
        talker: (EntityId, u16),
        listener: (EntityId, u16),
    ) -> Self {
        Self {
            message_type,
            status: AcmpStatus::Success,
            stream_id: StreamId::default(),
            controller_entity_id,
            talker_entity_id: talker.0,
            listener_entity_id: listener.0,
            talker_unique_id: talker.1,
            listener_unique_id: listener.1,
            stream_dest_mac: MacAddress::ZERO,
            connection_count: 0,
            sequence_id: 0,
            flags: AcmpFlags::default(),
            stream_vlan_id: 0,
        }
    }

    /// Copy of this PDU turned into its response with `status`
    #[must_use]
    pub fn to_response(&self, status: AcmpStatus) -> Self {
        Self {
            message_type: self.message_type.response(),
            status,
            ..self.clone()
        }
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        ControlHeader {
            subtype: Subtype::Acmp,
            message_type: self.message_type as u8,
            status: self.status as u8,
            control_data_length: Self::CONTROL_DATA_LENGTH as u16,
            id: self.stream_id.0,
        }
        .encode(&mut buf);
        buf.put_u64(self.controller_entity_id.0);
        buf.put_u64(self.talker_entity_id.0);
        buf.put_u64(self.listener_entity_id.0);
        buf.put_u16(self.talker_unique_id);
        buf.put_u16(self.listener_unique_id);
        buf.put_slice(&self.stream_dest_mac.0);
        buf.put_u16(self.connection_count);
        buf.put_u16(self.sequence_id);
        buf.put_u16(self.flags.0);
        buf.put_u16(self.stream_vlan_id);
        buf.put_u16(0);
        buf.freeze()
    }

    /// Decode the body of an ACMP PDU whose header was already parsed
    ///
    /// # Errors
    ///
    /// Fails on an unknown message type or status, or a short body.
    pub fn decode_body(header: &ControlHeader, body: &[u8]) -> Result<Self, PduError> {
        let message_type = AcmpMessageType::from_nibble(header.message_type)?;
        let status = AcmpStatus::from_u8(header.status)?;
        require_len(body, Self::CONTROL_DATA_LENGTH)?;
        let mut b = body;
        let controller_entity_id = EntityId(b.get_u64());
        let talker_entity_id = EntityId(b.get_u64());
        let listener_entity_id = EntityId(b.get_u64());
        let talker_unique_id = b.get_u16();
        let listener_unique_id = b.get_u16();
        let mut mac = [0u8; 6];
        b.copy_to_slice(&mut mac);
        let connection_count = b.get_u16();
        let sequence_id = b.get_u16();
        let flags = AcmpFlags(b.get_u16());
        let stream_vlan_id = b.get_u16();

        Ok(Self {
            message_type,
            status,
            stream_id: StreamId(header.id),
            controller_entity_id,
            talker_entity_id,
            listener_entity_id,
            talker_unique_id,
            listener_unique_id,
            stream_dest_mac: MacAddress(mac),
            connection_count,
            sequence_id,
            flags,
            stream_vlan_id,
        })
    }

    /// Decode a complete ACMP PDU
    ///
    /// # Errors
    ///
    /// Fails if the header is invalid, the subtype is not ACMP, or the body
    /// is malformed.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        let (header, body) = ControlHeader::decode(data)?;
        if header.subtype != Subtype::Acmp {
            return Err(PduError::UnknownSubtype(header.subtype as u8));
        }
        Self::decode_body(&header, body)
    }
}
