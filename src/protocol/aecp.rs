//! AECP (enumeration and control) PDU.
//!
//! AEM commands, generic vendor-unique commands and Milan vendor-unique
//! commands share the same header; they differ in what follows the
//! sequence id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::PduError;
use super::avtp::{ControlHeader, MAX_CONTROL_DATA_LENGTH, Subtype, require_len};
use crate::types::EntityId;

/// Protocol id of Milan vendor-unique commands
pub const MILAN_PROTOCOL_ID: u64 = 0x001B_C50A_C100;

/// AECP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AecpMessageType {
    /// AEM command
    AemCommand = 0,
    /// AEM response
    AemResponse = 1,
    /// Address access command
    AddressAccessCommand = 2,
    /// Address access response
    AddressAccessResponse = 3,
    /// Legacy AV/C command
    AvcCommand = 4,
    /// Legacy AV/C response
    AvcResponse = 5,
    /// Vendor unique command
    VendorUniqueCommand = 6,
    /// Vendor unique response
    VendorUniqueResponse = 7,
    /// HDCP APM command
    HdcpApmCommand = 8,
    /// HDCP APM response
    HdcpApmResponse = 9,
    /// Extended command
    ExtendedCommand = 14,
    /// Extended response
    ExtendedResponse = 15,
}

impl AecpMessageType {
    /// Parse from the 4-bit header field
    ///
    /// # Errors
    ///
    /// Returns `PduError::UnknownMessageType` for reserved values.
    pub fn from_nibble(value: u8) -> Result<Self, PduError> {
        Ok(match value & 0x0F {
            0 => Self::AemCommand,
            1 => Self::AemResponse,
            2 => Self::AddressAccessCommand,
            3 => Self::AddressAccessResponse,
            4 => Self::AvcCommand,
            5 => Self::AvcResponse,
            6 => Self::VendorUniqueCommand,
            7 => Self::VendorUniqueResponse,
            8 => Self::HdcpApmCommand,
            9 => Self::HdcpApmResponse,
            14 => Self::ExtendedCommand,
            15 => Self::ExtendedResponse,
            other => {
                return Err(PduError::UnknownMessageType {
                    protocol: Subtype::Aecp,
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
}

/// AECP status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AecpStatus {
    /// Command completed
    Success = 0,
    /// Command not implemented by the target
    NotImplemented = 1,
    /// Descriptor does not exist
    NoSuchDescriptor = 2,
    /// Entity locked by another controller
    EntityLocked = 3,
    /// Entity acquired by another controller
    EntityAcquired = 4,
    /// Controller is not authenticated
    NotAuthenticated = 5,
    /// Authentication is disabled
    AuthenticationDisabled = 6,
    /// Arguments are invalid
    BadArguments = 7,
    /// Target lacks resources
    NoResources = 8,
    /// Command accepted, response follows later
    InProgress = 9,
    /// Entity misbehaved
    EntityMisbehaving = 10,
    /// Command not supported on this object
    NotSupported = 11,
    /// Stream is running
    StreamIsRunning = 12,
    /// No response from the target, never sent on the wire
    Timeout = 13,
}

impl AecpStatus {
    /// Parse from the 5-bit header field
    ///
    /// # Errors
    ///
    /// Returns `PduError::InvalidField` for reserved values.
    pub fn from_u8(value: u8) -> Result<Self, PduError> {
        Ok(match value {
            0 => Self::Success,
            1 => Self::NotImplemented,
            2 => Self::NoSuchDescriptor,
            3 => Self::EntityLocked,
            4 => Self::EntityAcquired,
            5 => Self::NotAuthenticated,
            6 => Self::AuthenticationDisabled,
            7 => Self::BadArguments,
            8 => Self::NoResources,
            9 => Self::InProgress,
            10 => Self::EntityMisbehaving,
            11 => Self::NotSupported,
            12 => Self::StreamIsRunning,
            other => {
                return Err(PduError::InvalidField {
                    field: "aecp status",
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

impl std::fmt::Display for AecpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// AEM command type (15 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AemCommandType(pub u16);

impl AemCommandType {
    /// ACQUIRE_ENTITY
    pub const ACQUIRE_ENTITY: Self = Self(0x0000);
    /// LOCK_ENTITY
    pub const LOCK_ENTITY: Self = Self(0x0001);
    /// ENTITY_AVAILABLE
    pub const ENTITY_AVAILABLE: Self = Self(0x0002);
    /// CONTROLLER_AVAILABLE
    pub const CONTROLLER_AVAILABLE: Self = Self(0x0003);
    /// READ_DESCRIPTOR
    pub const READ_DESCRIPTOR: Self = Self(0x0004);
    /// WRITE_DESCRIPTOR
    pub const WRITE_DESCRIPTOR: Self = Self(0x0005);
    /// SET_CONFIGURATION
    pub const SET_CONFIGURATION: Self = Self(0x0006);
    /// GET_CONFIGURATION
    pub const GET_CONFIGURATION: Self = Self(0x0007);
    /// SET_STREAM_FORMAT
    pub const SET_STREAM_FORMAT: Self = Self(0x0008);
    /// GET_STREAM_FORMAT
    pub const GET_STREAM_FORMAT: Self = Self(0x0009);
    /// SET_STREAM_INFO
    pub const SET_STREAM_INFO: Self = Self(0x000E);
    /// GET_STREAM_INFO
    pub const GET_STREAM_INFO: Self = Self(0x000F);
    /// SET_NAME
    pub const SET_NAME: Self = Self(0x0010);
    /// GET_NAME
    pub const GET_NAME: Self = Self(0x0011);
    /// SET_CONTROL
    pub const SET_CONTROL: Self = Self(0x0018);
    /// GET_CONTROL
    pub const GET_CONTROL: Self = Self(0x0019);
    /// START_STREAMING
    pub const START_STREAMING: Self = Self(0x0022);
    /// STOP_STREAMING
    pub const STOP_STREAMING: Self = Self(0x0023);
    /// REGISTER_UNSOLICITED_NOTIFICATION
    pub const REGISTER_UNSOLICITED_NOTIFICATION: Self = Self(0x0024);
    /// DEREGISTER_UNSOLICITED_NOTIFICATION
    pub const DEREGISTER_UNSOLICITED_NOTIFICATION: Self = Self(0x0025);
    /// GET_AVB_INFO
    pub const GET_AVB_INFO: Self = Self(0x0027);
    /// GET_AS_PATH
    pub const GET_AS_PATH: Self = Self(0x0028);
    /// GET_COUNTERS
    pub const GET_COUNTERS: Self = Self(0x0029);

    /// Symbolic name when known
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::ACQUIRE_ENTITY => "ACQUIRE_ENTITY",
            Self::LOCK_ENTITY => "LOCK_ENTITY",
            Self::ENTITY_AVAILABLE => "ENTITY_AVAILABLE",
            Self::CONTROLLER_AVAILABLE => "CONTROLLER_AVAILABLE",
            Self::READ_DESCRIPTOR => "READ_DESCRIPTOR",
            Self::WRITE_DESCRIPTOR => "WRITE_DESCRIPTOR",
            Self::SET_CONFIGURATION => "SET_CONFIGURATION",
            Self::GET_CONFIGURATION => "GET_CONFIGURATION",
            Self::SET_STREAM_FORMAT => "SET_STREAM_FORMAT",
            Self::GET_STREAM_FORMAT => "GET_STREAM_FORMAT",
            Self::SET_STREAM_INFO => "SET_STREAM_INFO",
            Self::GET_STREAM_INFO => "GET_STREAM_INFO",
            Self::SET_NAME => "SET_NAME",
            Self::GET_NAME => "GET_NAME",
            Self::SET_CONTROL => "SET_CONTROL",
            Self::GET_CONTROL => "GET_CONTROL",
            Self::START_STREAMING => "START_STREAMING",
            Self::STOP_STREAMING => "STOP_STREAMING",
            Self::REGISTER_UNSOLICITED_NOTIFICATION => "REGISTER_UNSOLICITED_NOTIFICATION",
            Self::DEREGISTER_UNSOLICITED_NOTIFICATION => "DEREGISTER_UNSOLICITED_NOTIFICATION",
            Self::GET_AVB_INFO => "GET_AVB_INFO",
            Self::GET_AS_PATH => "GET_AS_PATH",
            Self::GET_COUNTERS => "GET_COUNTERS",
            _ => return None,
        })
    }
}

impl std::fmt::Display for AemCommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "AEM_COMMAND(0x{:04x})", self.0),
        }
    }
}

/// Milan vendor-unique command type (15 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MvuCommandType(pub u16);

impl MvuCommandType {
    /// GET_MILAN_INFO
    pub const GET_MILAN_INFO: Self = Self(0x0000);
}

/// Message-type specific part of an AECP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AecpBody {
    /// AEM command or response
    Aem {
        /// Unsolicited response flag
        unsolicited: bool,
        /// Command type
        command_type: AemCommandType,
        /// Command-specific payload
        payload: Bytes,
    },
    /// Milan vendor-unique command or response
    Milan {
        /// Command type
        command_type: MvuCommandType,
        /// Command-specific payload
        payload: Bytes,
    },
    /// Other vendor-unique protocol
    VendorUnique {
        /// 48-bit protocol id
        protocol_id: u64,
        /// Vendor payload
        payload: Bytes,
    },
    /// Any other message type, kept opaque
    Other {
        /// Bytes after the sequence id
        payload: Bytes,
    },
}

impl AecpBody {
    /// Bytes following the AECP common fields
    fn encoded_len(&self) -> usize {
        match self {
            Self::Aem { payload, .. } => 2 + payload.len(),
            Self::Milan { payload, .. } => 6 + 4 + payload.len(),
            Self::VendorUnique { payload, .. } => 6 + payload.len(),
            Self::Other { payload } => payload.len(),
        }
    }

    /// Command payload
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Aem { payload, .. }
            | Self::Milan { payload, .. }
            | Self::VendorUnique { payload, .. }
            | Self::Other { payload } => payload,
        }
    }
}

/// AECP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AecpPdu {
    /// Message type
    pub message_type: AecpMessageType,
    /// Status (always `Success` in commands)
    pub status: AecpStatus,
    /// Entity the command is addressed to
    pub target_entity_id: EntityId,
    /// Controller that issued the command
    pub controller_entity_id: EntityId,
    /// Sequence id chosen by the controller
    pub sequence_id: u16,
    /// Message specific part
    pub body: AecpBody,
}

impl AecpPdu {
    /// Size of controller id plus sequence id
    pub const COMMON_SIZE: usize = 10;

    /// Largest payload an AEM PDU can carry
    pub const MAX_AEM_PAYLOAD: usize = MAX_CONTROL_DATA_LENGTH - Self::COMMON_SIZE - 2;

    /// AEM command with sequence id zero
    #[must_use]
    pub fn aem_command(
        target: EntityId,
        controller: EntityId,
        command_type: AemCommandType,
        payload: Bytes,
    ) -> Self {
        Self {
            message_type: AecpMessageType::AemCommand,
            status: AecpStatus::Success,
            target_entity_id: target,
            controller_entity_id: controller,
            sequence_id: 0,
            body: AecpBody::Aem {
                unsolicited: false,
                command_type,
                payload,
            },
        }
    }

    /// Vendor-unique command with sequence id zero, Milan when the
    /// protocol id says so
    #[must_use]
    pub fn vendor_unique_command(
        target: EntityId,
        controller: EntityId,
        protocol_id: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            message_type: AecpMessageType::VendorUniqueCommand,
            status: AecpStatus::Success,
            target_entity_id: target,
            controller_entity_id: controller,
            sequence_id: 0,
            body: AecpBody::VendorUnique {
                protocol_id: protocol_id & 0xFFFF_FFFF_FFFF,
                payload,
            },
        }
    }

    /// Milan vendor-unique command with sequence id zero
    #[must_use]
    pub fn milan_command(
        target: EntityId,
        controller: EntityId,
        command_type: MvuCommandType,
        payload: Bytes,
    ) -> Self {
        Self {
            message_type: AecpMessageType::VendorUniqueCommand,
            status: AecpStatus::Success,
            target_entity_id: target,
            controller_entity_id: controller,
            sequence_id: 0,
            body: AecpBody::Milan {
                command_type,
                payload,
            },
        }
    }

    /// AEM command type, if this is an AEM PDU
    #[must_use]
    pub fn aem_command_type(&self) -> Option<AemCommandType> {
        match &self.body {
            AecpBody::Aem { command_type, .. } => Some(*command_type),
            _ => None,
        }
    }

    /// Whether the unsolicited flag is set
    #[must_use]
    pub fn is_unsolicited(&self) -> bool {
        matches!(
            self.body,
            AecpBody::Aem {
                unsolicited: true,
                ..
            }
        )
    }

    /// Build a response to this command carrying `status` and `payload`
    #[must_use]
    pub fn to_response(&self, status: AecpStatus, payload: Bytes) -> Self {
        let body = match &self.body {
            AecpBody::Aem { command_type, .. } => AecpBody::Aem {
                unsolicited: false,
                command_type: *command_type,
                payload,
            },
            AecpBody::Milan { command_type, .. } => AecpBody::Milan {
                command_type: *command_type,
                payload,
            },
            AecpBody::VendorUnique { protocol_id, .. } => AecpBody::VendorUnique {
                protocol_id: *protocol_id,
                payload,
            },
            AecpBody::Other { .. } => AecpBody::Other { payload },
        };
        Self {
            message_type: self.message_type.response(),
            status,
            target_entity_id: self.target_entity_id,
            controller_entity_id: self.controller_entity_id,
            sequence_id: self.sequence_id,
            body,
        }
    }

    /// Value of the control_data_length field once encoded
    #[must_use]
    pub fn control_data_length(&self) -> usize {
        Self::COMMON_SIZE + self.body.encoded_len()
    }

    /// Whether the PDU fits the 11 bit control_data_length field
    #[must_use]
    pub fn fits(&self) -> bool {
        self.control_data_length() <= MAX_CONTROL_DATA_LENGTH
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let control_data_length = self.control_data_length();
        let mut buf = BytesMut::with_capacity(ControlHeader::SIZE + control_data_length);
        ControlHeader {
            subtype: Subtype::Aecp,
            message_type: self.message_type as u8,
            status: self.status as u8,
            control_data_length: u16::try_from(control_data_length).unwrap_or(u16::MAX),
            id: self.target_entity_id.0,
        }
        .encode(&mut buf);
        buf.put_u64(self.controller_entity_id.0);
        buf.put_u16(self.sequence_id);
        match &self.body {
            AecpBody::Aem {
                unsolicited,
                command_type,
                payload,
            } => {
                buf.put_u16((u16::from(*unsolicited) << 15) | (command_type.0 & 0x7FFF));
                buf.put_slice(payload);
            }
            AecpBody::Milan {
                command_type,
                payload,
            } => {
                put_u48(&mut buf, MILAN_PROTOCOL_ID);
                buf.put_u16(command_type.0 & 0x7FFF);
                buf.put_u16(0);
                buf.put_slice(payload);
            }
            AecpBody::VendorUnique {
                protocol_id,
                payload,
            } => {
                put_u48(&mut buf, *protocol_id);
                buf.put_slice(payload);
            }
            AecpBody::Other { payload } => buf.put_slice(payload),
        }
        buf.freeze()
    }

    /// Decode the body of an AECP PDU whose header was already parsed
    ///
    /// # Errors
    ///
    /// Fails on an unknown message type or status, or a body too short for
    /// its message type.
    pub fn decode_body(header: &ControlHeader, body: &[u8]) -> Result<Self, PduError> {
        let message_type = AecpMessageType::from_nibble(header.message_type)?;
        let status = AecpStatus::from_u8(header.status)?;
        require_len(body, Self::COMMON_SIZE)?;
        let mut b = body;
        let controller_entity_id = EntityId(b.get_u64());
        let sequence_id = b.get_u16();

        let body = match message_type {
            AecpMessageType::AemCommand | AecpMessageType::AemResponse => {
                require_len(b, 2)?;
                let word = b.get_u16();
                AecpBody::Aem {
                    unsolicited: word & 0x8000 != 0,
                    command_type: AemCommandType(word & 0x7FFF),
                    payload: Bytes::copy_from_slice(b),
                }
            }
            AecpMessageType::VendorUniqueCommand | AecpMessageType::VendorUniqueResponse => {
                require_len(b, 6)?;
                let protocol_id = get_u48(&mut b);
                if protocol_id == MILAN_PROTOCOL_ID {
                    require_len(b, 4)?;
                    let word = b.get_u16();
                    b.advance(2);
                    AecpBody::Milan {
                        command_type: MvuCommandType(word & 0x7FFF),
                        payload: Bytes::copy_from_slice(b),
                    }
                } else {
                    AecpBody::VendorUnique {
                        protocol_id,
                        payload: Bytes::copy_from_slice(b),
                    }
                }
            }
            _ => AecpBody::Other {
                payload: Bytes::copy_from_slice(b),
            },
        };

        Ok(Self {
            message_type,
            status,
            target_entity_id: EntityId(header.id),
            controller_entity_id,
            sequence_id,
            body,
        })
    }

    /// Decode a complete AECP PDU
    ///
    /// # Errors
    ///
    /// Fails if the header is invalid, the subtype is not AECP, or the body
    /// is malformed.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        let (header, body) = ControlHeader::decode(data)?;
        if header.subtype != Subtype::Aecp {
            return Err(PduError::UnknownSubtype(header.subtype as u8));
        }
        Self::decode_body(&header, body)
    }
}

fn put_u48(buf: &mut BytesMut, value: u64) {
    buf.put_slice(&value.to_be_bytes()[2..]);
}

fn get_u48(b: &mut &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    b.copy_to_slice(&mut raw[2..]);
    u64::from_be_bytes(raw)
}

/// Milan GET_MILAN_INFO response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MilanInfo {
    /// Milan protocol version
    pub protocol_version: u32,
    /// Feature flags
    pub features_flags: u32,
    /// Certification version
    pub certification_version: u32,
}

impl MilanInfo {
    /// Encoded size
    pub const SIZE: usize = 12;

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.protocol_version);
        buf.put_u32(self.features_flags);
        buf.put_u32(self.certification_version);
        buf.freeze()
    }

    /// Decode from a response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` if fewer than 12 bytes are given.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::SIZE)?;
        let mut b = data;
        Ok(Self {
            protocol_version: b.get_u32(),
            features_flags: b.get_u32(),
            certification_version: b.get_u32(),
        })
    }
}
