//! AEM command payloads and descriptors.
//!
//! Only the descriptors an entity model needs to describe talkers,
//! listeners and controls are parsed into typed structures. Everything else
//! is carried as raw bytes so that a controller can still cache it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::PduError;
use super::avtp::require_len;
use crate::types::{
    ControllerCapabilities, EntityCapabilities, EntityId, ListenerCapabilities, MacAddress,
    StreamId, TalkerCapabilities,
};

/// Size of fixed-length AEM strings
pub const STRING_SIZE: usize = 64;

/// Sentinel for "no localized string"
pub const NO_STRING: u16 = 0xFFFF;

/// Descriptor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorType {
    /// ENTITY
    Entity,
    /// CONFIGURATION
    Configuration,
    /// AUDIO_UNIT
    AudioUnit,
    /// STREAM_INPUT
    StreamInput,
    /// STREAM_OUTPUT
    StreamOutput,
    /// AVB_INTERFACE
    AvbInterface,
    /// CLOCK_SOURCE
    ClockSource,
    /// LOCALE
    Locale,
    /// STRINGS
    Strings,
    /// CONTROL
    Control,
    /// CLOCK_DOMAIN
    ClockDomain,
    /// Any other descriptor type
    Other(u16),
}

impl From<u16> for DescriptorType {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => Self::Entity,
            0x0001 => Self::Configuration,
            0x0002 => Self::AudioUnit,
            0x0005 => Self::StreamInput,
            0x0006 => Self::StreamOutput,
            0x0009 => Self::AvbInterface,
            0x000A => Self::ClockSource,
            0x000C => Self::Locale,
            0x000D => Self::Strings,
            0x001A => Self::Control,
            0x0024 => Self::ClockDomain,
            other => Self::Other(other),
        }
    }
}

impl From<DescriptorType> for u16 {
    fn from(value: DescriptorType) -> Self {
        match value {
            DescriptorType::Entity => 0x0000,
            DescriptorType::Configuration => 0x0001,
            DescriptorType::AudioUnit => 0x0002,
            DescriptorType::StreamInput => 0x0005,
            DescriptorType::StreamOutput => 0x0006,
            DescriptorType::AvbInterface => 0x0009,
            DescriptorType::ClockSource => 0x000A,
            DescriptorType::Locale => 0x000C,
            DescriptorType::Strings => 0x000D,
            DescriptorType::Control => 0x001A,
            DescriptorType::ClockDomain => 0x0024,
            DescriptorType::Other(other) => other,
        }
    }
}

/// (descriptor_type, descriptor_index) pair used by most AEM commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorRef {
    /// Descriptor type
    pub descriptor_type: DescriptorType,
    /// Descriptor index
    pub descriptor_index: u16,
}

impl DescriptorRef {
    /// Encoded size
    pub const SIZE: usize = 4;

    /// Create a reference
    #[must_use]
    pub fn new(descriptor_type: DescriptorType, descriptor_index: u16) -> Self {
        Self {
            descriptor_type,
            descriptor_index,
        }
    }

    /// The ENTITY descriptor
    #[must_use]
    pub fn entity() -> Self {
        Self::new(DescriptorType::Entity, 0)
    }

    /// Append to `buf`
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.descriptor_type.into());
        buf.put_u16(self.descriptor_index);
    }

    /// Encode as a standalone payload
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.put(&mut buf);
        buf.freeze()
    }

    /// Read from the front of `b`
    fn get(b: &mut &[u8]) -> Self {
        let descriptor_type = DescriptorType::from(b.get_u16());
        Self::new(descriptor_type, b.get_u16())
    }

    /// Decode a payload that starts with a descriptor reference
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for fewer than 4 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::SIZE)?;
        let mut b = data;
        Ok(Self::get(&mut b))
    }
}

impl std::fmt::Display for DescriptorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.descriptor_type, self.descriptor_index)
    }
}

/// ACQUIRE_ENTITY flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquireFlags(pub u32);

impl AcquireFlags {
    /// Acquisition survives controller departure
    pub const PERSISTENT: Self = Self(1);
    /// Release instead of acquire
    pub const RELEASE: Self = Self(1 << 31);

    /// All bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// LOCK_ENTITY flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockFlags(pub u32);

impl LockFlags {
    /// Unlock instead of lock
    pub const UNLOCK: Self = Self(1);

    /// All bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Payload of ACQUIRE_ENTITY and LOCK_ENTITY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipPayload {
    /// Raw flags, see `AcquireFlags` and `LockFlags`
    pub flags: u32,
    /// Current or requested owner
    pub owner_id: EntityId,
    /// Target descriptor
    pub descriptor: DescriptorRef,
}

impl OwnershipPayload {
    /// Encoded size
    pub const SIZE: usize = 16;

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.flags);
        buf.put_u64(self.owner_id.0);
        self.descriptor.put(&mut buf);
        buf.freeze()
    }

    /// Decode from a command or response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for fewer than 16 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::SIZE)?;
        let mut b = data;
        Ok(Self {
            flags: b.get_u32(),
            owner_id: EntityId(b.get_u64()),
            descriptor: DescriptorRef::get(&mut b),
        })
    }
}

/// READ_DESCRIPTOR command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDescriptorCommand {
    /// Configuration the descriptor belongs to
    pub configuration_index: u16,
    /// Requested descriptor
    pub descriptor: DescriptorRef,
}

impl ReadDescriptorCommand {
    /// Encoded size
    pub const SIZE: usize = 8;

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16(self.configuration_index);
        buf.put_u16(0);
        self.descriptor.put(&mut buf);
        buf.freeze()
    }

    /// Decode from a command payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for fewer than 8 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::SIZE)?;
        let mut b = data;
        let configuration_index = b.get_u16();
        b.advance(2);
        Ok(Self {
            configuration_index,
            descriptor: DescriptorRef::get(&mut b),
        })
    }
}

/// READ_DESCRIPTOR response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDescriptorResponse {
    /// Configuration the descriptor belongs to
    pub configuration_index: u16,
    /// The descriptor
    pub descriptor: Descriptor,
}

impl ReadDescriptorResponse {
    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let body = self.descriptor.encode();
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u16(self.configuration_index);
        buf.put_u16(0);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decode from a response payload
    ///
    /// # Errors
    ///
    /// Fails when the payload or the embedded descriptor is truncated.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, 4)?;
        let configuration_index = u16::from_be_bytes([data[0], data[1]]);
        Ok(Self {
            configuration_index,
            descriptor: Descriptor::decode(&data[4..])?,
        })
    }
}

/// Payload of SET_CONTROL and GET_CONTROL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPayload {
    /// Target CONTROL descriptor
    pub descriptor: DescriptorRef,
    /// Encoded values, one byte per value for linear `u8` controls
    pub values: Bytes,
}

impl ControlPayload {
    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DescriptorRef::SIZE + self.values.len());
        self.descriptor.put(&mut buf);
        buf.put_slice(&self.values);
        buf.freeze()
    }

    /// Decode from a command or response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for fewer than 4 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        let descriptor = DescriptorRef::decode(data)?;
        Ok(Self {
            descriptor,
            values: Bytes::copy_from_slice(&data[DescriptorRef::SIZE..]),
        })
    }
}

/// Number of counters in a GET_COUNTERS response
pub const COUNTER_COUNT: usize = 32;

/// AVB_INTERFACE counter indices
pub mod avb_interface_counters {
    /// Link came up
    pub const LINK_UP: usize = 0;
    /// Link went down
    pub const LINK_DOWN: usize = 1;
    /// AVDECC frames transmitted
    pub const FRAMES_TX: usize = 2;
    /// AVDECC frames received
    pub const FRAMES_RX: usize = 3;
    /// CRC errors
    pub const RX_CRC_ERROR: usize = 4;
    /// gPTP grandmaster changed
    pub const GPTP_GM_CHANGED: usize = 5;
}

/// GET_COUNTERS response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountersResponse {
    /// Descriptor the counters belong to
    pub descriptor: DescriptorRef,
    /// Bitmap of valid counters
    pub counters_valid: u32,
    /// Counter values
    pub counters: [u32; COUNTER_COUNT],
}

impl CountersResponse {
    /// Encoded size
    pub const SIZE: usize = DescriptorRef::SIZE + 4 + 4 * COUNTER_COUNT;

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.descriptor.put(&mut buf);
        buf.put_u32(self.counters_valid);
        for counter in &self.counters {
            buf.put_u32(*counter);
        }
        buf.freeze()
    }

    /// Decode from a response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for a truncated payload.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::SIZE)?;
        let mut b = data;
        let descriptor = DescriptorRef::get(&mut b);
        let counters_valid = b.get_u32();
        let mut counters = [0u32; COUNTER_COUNT];
        for counter in &mut counters {
            *counter = b.get_u32();
        }
        Ok(Self {
            descriptor,
            counters_valid,
            counters,
        })
    }
}

/// Payload of SET_STREAM_FORMAT and GET_STREAM_FORMAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormatPayload {
    /// Target STREAM_INPUT or STREAM_OUTPUT
    pub descriptor: DescriptorRef,
    /// Requested or current format
    pub stream_format: u64,
}

impl StreamFormatPayload {
    /// Encoded size
    pub const SIZE: usize = DescriptorRef::SIZE + 8;

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.descriptor.put(&mut buf);
        buf.put_u64(self.stream_format);
        buf.freeze()
    }

    /// Decode from a command or response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for fewer than 12 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::SIZE)?;
        let mut b = data;
        Ok(Self {
            descriptor: DescriptorRef::get(&mut b),
            stream_format: b.get_u64(),
        })
    }
}

/// GET_STREAM_INFO flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfoFlags(pub u32);

impl StreamInfoFlags {
    /// SR class B
    pub const CLASS_B: Self = Self(1);
    /// Fast connect is set up
    pub const FAST_CONNECT: Self = Self(1 << 1);
    /// Connection state is saved
    pub const SAVED_STATE: Self = Self(1 << 2);
    /// Connected but not streaming
    pub const STREAMING_WAIT: Self = Self(1 << 3);
    /// `stream_vlan_id` is valid
    pub const STREAM_VLAN_ID_VALID: Self = Self(1 << 25);
    /// The stream is connected
    pub const CONNECTED: Self = Self(1 << 26);
    /// `msrp_failure_code` and `msrp_failure_bridge_id` are valid
    pub const MSRP_FAILURE_VALID: Self = Self(1 << 27);
    /// `stream_dest_mac` is valid
    pub const STREAM_DEST_MAC_VALID: Self = Self(1 << 28);
    /// `msrp_accumulated_latency` is valid
    pub const MSRP_ACC_LAT_VALID: Self = Self(1 << 29);
    /// `stream_id` is valid
    pub const STREAM_ID_VALID: Self = Self(1 << 30);
    /// `stream_format` is valid
    pub const STREAM_FORMAT_VALID: Self = Self(1 << 31);

    /// All bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StreamInfoFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StreamInfoFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// GET_STREAM_INFO response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream the information belongs to
    pub descriptor: DescriptorRef,
    /// Which fields are valid, plus stream state
    pub flags: StreamInfoFlags,
    /// Current format
    pub stream_format: u64,
    /// Stream id
    pub stream_id: StreamId,
    /// MSRP accumulated latency in nanoseconds
    pub msrp_accumulated_latency: u32,
    /// Destination MAC
    pub stream_dest_mac: MacAddress,
    /// MSRP failure code
    pub msrp_failure_code: u8,
    /// Bridge that reported the MSRP failure
    pub msrp_failure_bridge_id: u64,
    /// VLAN of the stream
    pub stream_vlan_id: u16,
}

impl StreamInfo {
    /// Encoded size
    pub const SIZE: usize = 48;

    /// Empty information for `descriptor`
    #[must_use]
    pub fn new(descriptor: DescriptorRef) -> Self {
        Self {
            descriptor,
            flags: StreamInfoFlags::default(),
            stream_format: 0,
            stream_id: StreamId::default(),
            msrp_accumulated_latency: 0,
            stream_dest_mac: MacAddress::ZERO,
            msrp_failure_code: 0,
            msrp_failure_bridge_id: 0,
            stream_vlan_id: 0,
        }
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.descriptor.put(&mut buf);
        buf.put_u32(self.flags.0);
        buf.put_u64(self.stream_format);
        buf.put_u64(self.stream_id.0);
        buf.put_u32(self.msrp_accumulated_latency);
        buf.put_slice(&self.stream_dest_mac.0);
        buf.put_u8(self.msrp_failure_code);
        buf.put_u8(0);
        buf.put_u64(self.msrp_failure_bridge_id);
        buf.put_u16(self.stream_vlan_id);
        buf.put_u16(0);
        buf.freeze()
    }

    /// Decode from a response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for fewer than 48 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::SIZE)?;
        let mut b = data;
        let descriptor = DescriptorRef::get(&mut b);
        let flags = StreamInfoFlags(b.get_u32());
        let stream_format = b.get_u64();
        let stream_id = StreamId(b.get_u64());
        let msrp_accumulated_latency = b.get_u32();
        let mut mac = [0u8; 6];
        b.copy_to_slice(&mut mac);
        let msrp_failure_code = b.get_u8();
        b.advance(1);
        Ok(Self {
            descriptor,
            flags,
            stream_format,
            stream_id,
            msrp_accumulated_latency,
            stream_dest_mac: MacAddress(mac),
            msrp_failure_code,
            msrp_failure_bridge_id: b.get_u64(),
            stream_vlan_id: b.get_u16(),
        })
    }
}

/// GET_AVB_INFO flags
pub mod avb_info_flags {
    /// The port is gPTP capable
    pub const AS_CAPABLE: u8 = 1;
    /// gPTP is running
    pub const GPTP_ENABLED: u8 = 1 << 1;
    /// MSRP is running
    pub const SRP_ENABLED: u8 = 1 << 2;
}

/// One SR class to priority and VLAN mapping of GET_AVB_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrpMapping {
    /// SR class id
    pub traffic_class: u8,
    /// PCP of the class
    pub priority: u8,
    /// VLAN of the class
    pub vlan_id: u16,
}

/// GET_AVB_INFO response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvbInfo {
    /// AVB_INTERFACE the information belongs to
    pub descriptor: DescriptorRef,
    /// Current grandmaster
    pub gptp_grandmaster_id: u64,
    /// Link propagation delay in nanoseconds
    pub propagation_delay: u32,
    /// gPTP domain
    pub gptp_domain_number: u8,
    /// See [`avb_info_flags`]
    pub flags: u8,
    /// SR class mappings
    pub msrp_mappings: Vec<MsrpMapping>,
}

impl AvbInfo {
    /// Size without mappings
    pub const FIXED_SIZE: usize = 20;

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE + 4 * self.msrp_mappings.len());
        self.descriptor.put(&mut buf);
        buf.put_u64(self.gptp_grandmaster_id);
        buf.put_u32(self.propagation_delay);
        buf.put_u8(self.gptp_domain_number);
        buf.put_u8(self.flags);
        buf.put_u16(u16::try_from(self.msrp_mappings.len()).unwrap_or(u16::MAX));
        for mapping in &self.msrp_mappings {
            buf.put_u8(mapping.traffic_class);
            buf.put_u8(mapping.priority);
            buf.put_u16(mapping.vlan_id);
        }
        buf.freeze()
    }

    /// Decode from a response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` when the fixed part or a mapping is
    /// truncated.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::FIXED_SIZE)?;
        let mut b = data;
        let descriptor = DescriptorRef::get(&mut b);
        let gptp_grandmaster_id = b.get_u64();
        let propagation_delay = b.get_u32();
        let gptp_domain_number = b.get_u8();
        let flags = b.get_u8();
        let count = usize::from(b.get_u16());
        require_len(data, Self::FIXED_SIZE + 4 * count)?;
        let msrp_mappings = (0..count)
            .map(|_| MsrpMapping {
                traffic_class: b.get_u8(),
                priority: b.get_u8(),
                vlan_id: b.get_u16(),
            })
            .collect();
        Ok(Self {
            descriptor,
            gptp_grandmaster_id,
            propagation_delay,
            gptp_domain_number,
            flags,
            msrp_mappings,
        })
    }
}

/// Payload of SET_NAME and GET_NAME.
///
/// GET_NAME commands stop before `name`; it decodes as empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePayload {
    /// Named descriptor
    pub descriptor: DescriptorRef,
    /// Which name of the descriptor; ENTITY has two
    pub name_index: u16,
    /// Configuration of the descriptor
    pub configuration_index: u16,
    /// The name
    pub name: String,
}

impl NamePayload {
    /// Size of a GET_NAME command
    pub const COMMAND_SIZE: usize = 8;
    /// Size with the name
    pub const SIZE: usize = Self::COMMAND_SIZE + STRING_SIZE;

    /// Encode to bytes, name included
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.descriptor.put(&mut buf);
        buf.put_u16(self.name_index);
        buf.put_u16(self.configuration_index);
        put_string(&mut buf, &self.name);
        buf.freeze()
    }

    /// Whether `data` carries a name
    #[must_use]
    pub fn has_name(data: &[u8]) -> bool {
        data.len() >= Self::SIZE
    }

    /// Decode from a command or response payload
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` for fewer than 8 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        require_len(data, Self::COMMAND_SIZE)?;
        let mut b = data;
        let descriptor = DescriptorRef::get(&mut b);
        let name_index = b.get_u16();
        let configuration_index = b.get_u16();
        let name = if Self::has_name(data) {
            get_string(&mut b)
        } else {
            String::new()
        };
        Ok(Self {
            descriptor,
            name_index,
            configuration_index,
            name,
        })
    }
}

/// Write a fixed 64-byte, zero padded string
fn put_string(buf: &mut BytesMut, s: &str) {
    let mut end = s.len().min(STRING_SIZE);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&s.as_bytes()[..end]);
    buf.put_bytes(0, STRING_SIZE - end);
}

/// Read a fixed 64-byte string, stopping at the first NUL
fn get_string(b: &mut &[u8]) -> String {
    let raw = &b[..STRING_SIZE];
    let len = raw.iter().position(|c| *c == 0).unwrap_or(STRING_SIZE);
    let s = String::from_utf8_lossy(&raw[..len]).into_owned();
    b.advance(STRING_SIZE);
    s
}

/// ENTITY descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Entity id
    pub entity_id: EntityId,
    /// Entity model id
    pub entity_model_id: u64,
    /// Entity capabilities
    pub entity_capabilities: EntityCapabilities,
    /// Talker stream sources
    pub talker_stream_sources: u16,
    /// Talker capabilities
    pub talker_capabilities: TalkerCapabilities,
    /// Listener stream sinks
    pub listener_stream_sinks: u16,
    /// Listener capabilities
    pub listener_capabilities: ListenerCapabilities,
    /// Controller capabilities
    pub controller_capabilities: ControllerCapabilities,
    /// Available index
    pub available_index: u32,
    /// Association id
    pub association_id: u64,
    /// Entity name
    pub entity_name: String,
    /// Localized vendor name
    pub vendor_name_string: u16,
    /// Localized model name
    pub model_name_string: u16,
    /// Firmware version
    pub firmware_version: String,
    /// Group name
    pub group_name: String,
    /// Serial number
    pub serial_number: String,
    /// Number of configurations
    pub configurations_count: u16,
    /// Active configuration
    pub current_configuration: u16,
}

impl EntityDescriptor {
    /// Encoded size
    pub const SIZE: usize = 312;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64(self.entity_id.0);
        buf.put_u64(self.entity_model_id);
        buf.put_u32(self.entity_capabilities.bits());
        buf.put_u16(self.talker_stream_sources);
        buf.put_u16(self.talker_capabilities.bits());
        buf.put_u16(self.listener_stream_sinks);
        buf.put_u16(self.listener_capabilities.bits());
        buf.put_u32(self.controller_capabilities.bits());
        buf.put_u32(self.available_index);
        buf.put_u64(self.association_id);
        put_string(buf, &self.entity_name);
        buf.put_u16(self.vendor_name_string);
        buf.put_u16(self.model_name_string);
        put_string(buf, &self.firmware_version);
        put_string(buf, &self.group_name);
        put_string(buf, &self.serial_number);
        buf.put_u16(self.configurations_count);
        buf.put_u16(self.current_configuration);
    }

    fn get(b: &mut &[u8]) -> Self {
        Self {
            entity_id: EntityId(b.get_u64()),
            entity_model_id: b.get_u64(),
            entity_capabilities: EntityCapabilities(b.get_u32()),
            talker_stream_sources: b.get_u16(),
            talker_capabilities: TalkerCapabilities(b.get_u16()),
            listener_stream_sinks: b.get_u16(),
            listener_capabilities: ListenerCapabilities(b.get_u16()),
            controller_capabilities: ControllerCapabilities(b.get_u32()),
            available_index: b.get_u32(),
            association_id: b.get_u64(),
            entity_name: get_string(b),
            vendor_name_string: b.get_u16(),
            model_name_string: b.get_u16(),
            firmware_version: get_string(b),
            group_name: get_string(b),
            serial_number: get_string(b),
            configurations_count: b.get_u16(),
            current_configuration: b.get_u16(),
        }
    }
}

/// CONFIGURATION descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    /// Object name
    pub object_name: String,
    /// Localized description
    pub localized_description: u16,
    /// Number of descriptors of each type in this configuration
    pub descriptor_counts: Vec<(DescriptorType, u16)>,
}

impl ConfigurationDescriptor {
    /// Offset of the descriptor counts
    pub const COUNTS_OFFSET: u16 = 74;

    fn put(&self, buf: &mut BytesMut) {
        put_string(buf, &self.object_name);
        buf.put_u16(self.localized_description);
        buf.put_u16(u16::try_from(self.descriptor_counts.len()).unwrap_or(u16::MAX));
        buf.put_u16(Self::COUNTS_OFFSET);
        for (descriptor_type, count) in &self.descriptor_counts {
            buf.put_u16((*descriptor_type).into());
            buf.put_u16(*count);
        }
    }

    fn get(data: &[u8], b: &mut &[u8]) -> Result<Self, PduError> {
        let object_name = get_string(b);
        let localized_description = b.get_u16();
        let count = usize::from(b.get_u16());
        let offset = usize::from(b.get_u16());
        let end = offset + count * 4;
        require_len(data, end)?;
        let mut counts = &data[offset..end];
        let descriptor_counts = (0..count)
            .map(|_| (DescriptorType::from(counts.get_u16()), counts.get_u16()))
            .collect();
        Ok(Self {
            object_name,
            localized_description,
            descriptor_counts,
        })
    }
}

/// STREAM_INPUT or STREAM_OUTPUT descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Object name
    pub object_name: String,
    /// Localized description
    pub localized_description: u16,
    /// CLOCK_DOMAIN used by the stream
    pub clock_domain_index: u16,
    /// Stream flags
    pub stream_flags: u16,
    /// Current stream format
    pub current_format: u64,
    /// Backup talkers (entity id, unique id)
    pub backup_talkers: [(EntityId, u16); 3],
    /// Talker this stream backs up
    pub backedup_talker: (EntityId, u16),
    /// AVB_INTERFACE the stream uses
    pub avb_interface_index: u16,
    /// Buffer length in nanoseconds
    pub buffer_length: u32,
    /// Supported formats
    pub formats: Vec<u64>,
}

impl StreamDescriptor {
    /// Offset of the format list
    pub const FORMATS_OFFSET: u16 = 132;

    /// Stream flag: class A
    pub const FLAG_CLASS_A: u16 = 1 << 1;
    /// Stream flag: class B
    pub const FLAG_CLASS_B: u16 = 1 << 2;

    fn put(&self, buf: &mut BytesMut) {
        put_string(buf, &self.object_name);
        buf.put_u16(self.localized_description);
        buf.put_u16(self.clock_domain_index);
        buf.put_u16(self.stream_flags);
        buf.put_u64(self.current_format);
        buf.put_u16(Self::FORMATS_OFFSET);
        buf.put_u16(u16::try_from(self.formats.len()).unwrap_or(u16::MAX));
        for (entity, unique) in &self.backup_talkers {
            buf.put_u64(entity.0);
            buf.put_u16(*unique);
        }
        buf.put_u64(self.backedup_talker.0.0);
        buf.put_u16(self.backedup_talker.1);
        buf.put_u16(self.avb_interface_index);
        buf.put_u32(self.buffer_length);
        for format in &self.formats {
            buf.put_u64(*format);
        }
    }

    fn get(data: &[u8], b: &mut &[u8]) -> Result<Self, PduError> {
        let object_name = get_string(b);
        let localized_description = b.get_u16();
        let clock_domain_index = b.get_u16();
        let stream_flags = b.get_u16();
        let current_format = b.get_u64();
        let offset = usize::from(b.get_u16());
        let count = usize::from(b.get_u16());
        let mut backup_talkers = [(EntityId::NONE, 0u16); 3];
        for slot in &mut backup_talkers {
            *slot = (EntityId(b.get_u64()), b.get_u16());
        }
        let backedup_talker = (EntityId(b.get_u64()), b.get_u16());
        let avb_interface_index = b.get_u16();
        let buffer_length = b.get_u32();
        let end = offset + count * 8;
        require_len(data, end)?;
        let mut formats_raw = &data[offset..end];
        let formats = (0..count).map(|_| formats_raw.get_u64()).collect();
        Ok(Self {
            object_name,
            localized_description,
            clock_domain_index,
            stream_flags,
            current_format,
            backup_talkers,
            backedup_talker,
            avb_interface_index,
            buffer_length,
            formats,
        })
    }
}

/// AVB_INTERFACE descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvbInterfaceDescriptor {
    /// Object name
    pub object_name: String,
    /// Localized description
    pub localized_description: u16,
    /// Interface MAC address
    pub mac_address: MacAddress,
    /// Interface flags
    pub interface_flags: u16,
    /// gPTP clock identity
    pub clock_identity: u64,
    /// gPTP priority1
    pub priority1: u8,
    /// gPTP clock class
    pub clock_class: u8,
    /// gPTP offset scaled log variance
    pub offset_scaled_log_variance: u16,
    /// gPTP clock accuracy
    pub clock_accuracy: u8,
    /// gPTP priority2
    pub priority2: u8,
    /// gPTP domain
    pub domain_number: u8,
    /// log2 sync interval
    pub log_sync_interval: i8,
    /// log2 announce interval
    pub log_announce_interval: i8,
    /// log2 pdelay interval
    pub log_pdelay_interval: i8,
    /// gPTP port number
    pub port_number: u16,
}

impl AvbInterfaceDescriptor {
    /// Encoded size
    pub const SIZE: usize = 98;

    fn put(&self, buf: &mut BytesMut) {
        put_string(buf, &self.object_name);
        buf.put_u16(self.localized_description);
        buf.put_slice(&self.mac_address.0);
        buf.put_u16(self.interface_flags);
        buf.put_u64(self.clock_identity);
        buf.put_u8(self.priority1);
        buf.put_u8(self.clock_class);
        buf.put_u16(self.offset_scaled_log_variance);
        buf.put_u8(self.clock_accuracy);
        buf.put_u8(self.priority2);
        buf.put_u8(self.domain_number);
        buf.put_i8(self.log_sync_interval);
        buf.put_i8(self.log_announce_interval);
        buf.put_i8(self.log_pdelay_interval);
        buf.put_u16(self.port_number);
    }

    fn get(b: &mut &[u8]) -> Self {
        let object_name = get_string(b);
        let localized_description = b.get_u16();
        let mut mac = [0u8; 6];
        b.copy_to_slice(&mut mac);
        Self {
            object_name,
            localized_description,
            mac_address: MacAddress(mac),
            interface_flags: b.get_u16(),
            clock_identity: b.get_u64(),
            priority1: b.get_u8(),
            clock_class: b.get_u8(),
            offset_scaled_log_variance: b.get_u16(),
            clock_accuracy: b.get_u8(),
            priority2: b.get_u8(),
            domain_number: b.get_u8(),
            log_sync_interval: b.get_i8(),
            log_announce_interval: b.get_i8(),
            log_pdelay_interval: b.get_i8(),
            port_number: b.get_u16(),
        }
    }
}

/// CLOCK_DOMAIN descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockDomainDescriptor {
    /// Object name
    pub object_name: String,
    /// Localized description
    pub localized_description: u16,
    /// CLOCK_SOURCE currently in use
    pub clock_source_index: u16,
    /// CLOCK_SOURCE descriptors the domain can select
    pub clock_sources: Vec<u16>,
}

impl ClockDomainDescriptor {
    /// Offset of the clock source list
    pub const SOURCES_OFFSET: u16 = 76;

    fn put(&self, buf: &mut BytesMut) {
        put_string(buf, &self.object_name);
        buf.put_u16(self.localized_description);
        buf.put_u16(self.clock_source_index);
        buf.put_u16(Self::SOURCES_OFFSET);
        buf.put_u16(u16::try_from(self.clock_sources.len()).unwrap_or(u16::MAX));
        for source in &self.clock_sources {
            buf.put_u16(*source);
        }
    }

    fn get(data: &[u8], b: &mut &[u8]) -> Result<Self, PduError> {
        let object_name = get_string(b);
        let localized_description = b.get_u16();
        let clock_source_index = b.get_u16();
        let offset = usize::from(b.get_u16());
        let count = usize::from(b.get_u16());
        let end = offset + count * 2;
        require_len(data, end)?;
        let mut sources = &data[offset..end];
        let clock_sources = (0..count).map(|_| sources.get_u16()).collect();
        Ok(Self {
            object_name,
            localized_description,
            clock_source_index,
            clock_sources,
        })
    }
}

/// Value details of a linear `u8` control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearU8Value {
    /// Minimum
    pub minimum: u8,
    /// Maximum
    pub maximum: u8,
    /// Step
    pub step: u8,
    /// Default
    pub default: u8,
    /// Current
    pub current: u8,
    /// Unit code
    pub unit: u16,
    /// Localized string
    pub string: u16,
}

impl LinearU8Value {
    /// Encoded size
    pub const SIZE: usize = 9;

    /// Whether `value` lies in range and on a step
    #[must_use]
    pub fn accepts(&self, value: u8) -> bool {
        (self.minimum..=self.maximum).contains(&value)
            && self.step != 0
            && (value - self.minimum) % self.step == 0
    }
}

/// CONTROL descriptor with linear `u8` values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Object name
    pub object_name: String,
    /// Localized description
    pub localized_description: u16,
    /// Block latency in nanoseconds
    pub block_latency: u32,
    /// Control latency in nanoseconds
    pub control_latency: u32,
    /// Control domain
    pub control_domain: u16,
    /// Value cannot be set
    pub read_only: bool,
    /// Control type (EUI-64)
    pub control_type: u64,
    /// Reset time in microseconds
    pub reset_time: u32,
    /// Signal source type
    pub signal_type: u16,
    /// Signal source index
    pub signal_index: u16,
    /// Signal source output
    pub signal_output: u16,
    /// Values
    pub values: Vec<LinearU8Value>,
}

impl ControlDescriptor {
    /// Offset of the value details
    pub const VALUES_OFFSET: u16 = 104;

    /// `control_value_type` of linear `u8` controls
    pub const LINEAR_UINT8: u16 = 0x0001;

    const READ_ONLY: u16 = 1 << 15;

    fn put(&self, buf: &mut BytesMut) {
        put_string(buf, &self.object_name);
        buf.put_u16(self.localized_description);
        buf.put_u32(self.block_latency);
        buf.put_u32(self.control_latency);
        buf.put_u16(self.control_domain);
        let read_only = if self.read_only { Self::READ_ONLY } else { 0 };
        buf.put_u16(read_only | Self::LINEAR_UINT8);
        buf.put_u64(self.control_type);
        buf.put_u32(self.reset_time);
        buf.put_u16(Self::VALUES_OFFSET);
        buf.put_u16(u16::try_from(self.values.len()).unwrap_or(u16::MAX));
        buf.put_u16(self.signal_type);
        buf.put_u16(self.signal_index);
        buf.put_u16(self.signal_output);
        for v in &self.values {
            buf.put_u8(v.minimum);
            buf.put_u8(v.maximum);
            buf.put_u8(v.step);
            buf.put_u8(v.default);
            buf.put_u8(v.current);
            buf.put_u16(v.unit);
            buf.put_u16(v.string);
        }
    }

    /// Returns `None` for value types other than linear `u8`
    fn get(data: &[u8], b: &mut &[u8]) -> Result<Option<Self>, PduError> {
        let object_name = get_string(b);
        let localized_description = b.get_u16();
        let block_latency = b.get_u32();
        let control_latency = b.get_u32();
        let control_domain = b.get_u16();
        let value_type = b.get_u16();
        if value_type & 0x3FFF != Self::LINEAR_UINT8 {
            return Ok(None);
        }
        let control_type = b.get_u64();
        let reset_time = b.get_u32();
        let offset = usize::from(b.get_u16());
        let count = usize::from(b.get_u16());
        let signal_type = b.get_u16();
        let signal_index = b.get_u16();
        let signal_output = b.get_u16();
        let end = offset + count * LinearU8Value::SIZE;
        require_len(data, end)?;
        let mut raw = &data[offset..end];
        let values = (0..count)
            .map(|_| LinearU8Value {
                minimum: raw.get_u8(),
                maximum: raw.get_u8(),
                step: raw.get_u8(),
                default: raw.get_u8(),
                current: raw.get_u8(),
                unit: raw.get_u16(),
                string: raw.get_u16(),
            })
            .collect();
        Ok(Some(Self {
            object_name,
            localized_description,
            block_latency,
            control_latency,
            control_domain,
            read_only: value_type & Self::READ_ONLY != 0,
            control_type,
            reset_time,
            signal_type,
            signal_index,
            signal_output,
            values,
        }))
    }
}

/// Descriptor body without its type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorBody {
    /// ENTITY
    Entity(EntityDescriptor),
    /// CONFIGURATION
    Configuration(ConfigurationDescriptor),
    /// STREAM_INPUT
    StreamInput(StreamDescriptor),
    /// STREAM_OUTPUT
    StreamOutput(StreamDescriptor),
    /// AVB_INTERFACE
    AvbInterface(AvbInterfaceDescriptor),
    /// CONTROL
    Control(ControlDescriptor),
    /// CLOCK_DOMAIN
    ClockDomain(ClockDomainDescriptor),
    /// Anything else, bytes following type and index
    Raw {
        /// Descriptor type
        descriptor_type: DescriptorType,
        /// Undecoded bytes
        data: Bytes,
    },
}

/// AEM descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor index
    pub descriptor_index: u16,
    /// Typed contents
    pub body: DescriptorBody,
}

impl Descriptor {
    /// Size of type plus index
    pub const HEADER_SIZE: usize = 4;

    /// Descriptor type
    #[must_use]
    pub fn descriptor_type(&self) -> DescriptorType {
        match &self.body {
            DescriptorBody::Entity(_) => DescriptorType::Entity,
            DescriptorBody::Configuration(_) => DescriptorType::Configuration,
            DescriptorBody::StreamInput(_) => DescriptorType::StreamInput,
            DescriptorBody::StreamOutput(_) => DescriptorType::StreamOutput,
            DescriptorBody::AvbInterface(_) => DescriptorType::AvbInterface,
            DescriptorBody::Control(_) => DescriptorType::Control,
            DescriptorBody::ClockDomain(_) => DescriptorType::ClockDomain,
            DescriptorBody::Raw {
                descriptor_type, ..
            } => *descriptor_type,
        }
    }

    /// Reference to this descriptor
    #[must_use]
    pub fn reference(&self) -> DescriptorRef {
        DescriptorRef::new(self.descriptor_type(), self.descriptor_index)
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(EntityDescriptor::SIZE);
        self.reference().put(&mut buf);
        match &self.body {
            DescriptorBody::Entity(d) => d.put(&mut buf),
            DescriptorBody::Configuration(d) => d.put(&mut buf),
            DescriptorBody::StreamInput(d) | DescriptorBody::StreamOutput(d) => d.put(&mut buf),
            DescriptorBody::AvbInterface(d) => d.put(&mut buf),
            DescriptorBody::Control(d) => d.put(&mut buf),
            DescriptorBody::ClockDomain(d) => d.put(&mut buf),
            DescriptorBody::Raw { data, .. } => buf.put_slice(data),
        }
        buf.freeze()
    }

    /// Decode a descriptor starting with its type and index
    ///
    /// # Errors
    ///
    /// Returns `PduError::TooShort` when a typed descriptor is truncated.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        let reference = DescriptorRef::decode(data)?;
        let mut b = &data[Self::HEADER_SIZE..];
        let raw = || DescriptorBody::Raw {
            descriptor_type: reference.descriptor_type,
            data: Bytes::copy_from_slice(&data[Self::HEADER_SIZE..]),
        };
        let body = match reference.descriptor_type {
            DescriptorType::Entity => {
                require_len(data, EntityDescriptor::SIZE)?;
                DescriptorBody::Entity(EntityDescriptor::get(&mut b))
            }
            DescriptorType::Configuration => {
                require_len(data, usize::from(ConfigurationDescriptor::COUNTS_OFFSET))?;
                DescriptorBody::Configuration(ConfigurationDescriptor::get(data, &mut b)?)
            }
            DescriptorType::StreamInput => {
                require_len(data, usize::from(StreamDescriptor::FORMATS_OFFSET))?;
                DescriptorBody::StreamInput(StreamDescriptor::get(data, &mut b)?)
            }
            DescriptorType::StreamOutput => {
                require_len(data, usize::from(StreamDescriptor::FORMATS_OFFSET))?;
                DescriptorBody::StreamOutput(StreamDescriptor::get(data, &mut b)?)
            }
            DescriptorType::AvbInterface => {
                require_len(data, AvbInterfaceDescriptor::SIZE)?;
                DescriptorBody::AvbInterface(AvbInterfaceDescriptor::get(&mut b))
            }
            DescriptorType::Control => {
                require_len(data, usize::from(ControlDescriptor::VALUES_OFFSET))?;
                match ControlDescriptor::get(data, &mut b)? {
                    Some(control) => DescriptorBody::Control(control),
                    None => raw(),
                }
            }
            DescriptorType::ClockDomain => {
                require_len(data, usize::from(ClockDomainDescriptor::SOURCES_OFFSET))?;
                DescriptorBody::ClockDomain(ClockDomainDescriptor::get(data, &mut b)?)
            }
            _ => raw(),
        };
        Ok(Self {
            descriptor_index: reference.descriptor_index,
            body,
        })
    }
}
