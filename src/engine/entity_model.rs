//! Descriptors and mutable state of the local entity

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::net::{GptpInfo, StreamDirection, StreamHandle};
use crate::protocol::aecp::AecpStatus;
use crate::protocol::aem::{
    AvbInterfaceDescriptor, ClockDomainDescriptor, ConfigurationDescriptor, ControlDescriptor,
    Descriptor, DescriptorBody, DescriptorRef, DescriptorType, EntityDescriptor, LinearU8Value,
    NO_STRING, StreamDescriptor,
};
use crate::types::{
    AvdeccConfig, ControllerCapabilities, EntityCapabilities, EntityConfig, EntityId, EntityInfo,
    ListenerCapabilities, ListenerStreamConfig, MacAddress, StreamId, TalkerCapabilities,
    TalkerStreamConfig,
};

/// Control type of the IDENTIFY control
pub const IDENTIFY_CONTROL_TYPE: u64 = 0x90E0_F000_0000_0001;

const AVB_INTERFACE_GPTP_SUPPORTED: u16 = 1 << 1;
const AVB_INTERFACE_SRP_SUPPORTED: u16 = 1 << 2;

fn rotating_hash(seed: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(seed, |hash, b| hash.rotate_left(4) ^ b)
}

/// Where a settable name lives
#[derive(Debug, Clone, Copy)]
enum NameSlot {
    Entity,
    Group,
    Configuration,
    Talker(usize),
    Listener(usize),
    Interface,
    ClockDomain,
    Control(usize),
}

/// The entity this stack answers for
#[derive(Debug, Clone)]
pub struct LocalEntity {
    entity_id: EntityId,
    mac_address: MacAddress,
    config: EntityConfig,
    available_index: u32,
    control_values: Vec<u8>,
    talker_formats: Vec<u64>,
    listener_formats: Vec<u64>,
    configuration_name: String,
    interface_name: String,
    clock_domain_name: String,
    running: HashSet<StreamHandle>,
}

impl LocalEntity {
    /// Build the entity described by `config`
    #[must_use]
    pub fn new(config: &AvdeccConfig) -> Self {
        Self {
            entity_id: config.entity_id(),
            mac_address: config.mac_address,
            available_index: config.entity.available_index,
            control_values: config.entity.controls.iter().map(|c| c.default).collect(),
            talker_formats: config.entity.talker_streams.iter().map(|t| t.format).collect(),
            listener_formats: config.entity.listener_streams.iter().map(|l| l.format).collect(),
            configuration_name: String::from("Default"),
            interface_name: String::new(),
            clock_domain_name: String::from("Media clock"),
            config: config.entity.clone(),
            running: HashSet::new(),
        }
    }

    /// Entity id
    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// MAC of the AVB interface
    #[must_use]
    pub fn mac_address(&self) -> MacAddress {
        self.mac_address
    }

    /// available_index of the next advertisement
    #[must_use]
    pub fn available_index(&self) -> u32 {
        self.available_index
    }

    /// Count one sent ENTITY_AVAILABLE
    pub fn advance_available_index(&mut self) {
        self.available_index = self.available_index.wrapping_add(1);
    }

    /// Whether the entity acts as a controller
    #[must_use]
    pub fn is_controller(&self) -> bool {
        self.config.controller
    }

    /// Talker stream configuration
    #[must_use]
    pub fn talker(&self, index: u16) -> Option<&TalkerStreamConfig> {
        self.config.talker_streams.get(usize::from(index))
    }

    /// Listener stream configuration
    #[must_use]
    pub fn listener(&self, index: u16) -> Option<&ListenerStreamConfig> {
        self.config.listener_streams.get(usize::from(index))
    }

    /// Number of talker streams
    #[must_use]
    pub fn talker_count(&self) -> u16 {
        u16::try_from(self.config.talker_streams.len()).unwrap_or(u16::MAX)
    }

    /// Number of listener streams
    #[must_use]
    pub fn listener_count(&self) -> u16 {
        u16::try_from(self.config.listener_streams.len()).unwrap_or(u16::MAX)
    }

    fn control_count(&self) -> u16 {
        u16::try_from(self.config.controls.len()).unwrap_or(u16::MAX)
    }

    /// Stream id of talker stream `index`: interface MAC then unique id
    #[must_use]
    pub fn stream_id(&self, index: u16) -> StreamId {
        StreamId::from_mac(self.mac_address, index)
    }

    /// Destination MAC of talker stream `index`.
    ///
    /// Taken from the configuration, or from the stream pool with the last
    /// octet hashed from the entity id and stream index.
    #[must_use]
    pub fn stream_dest_mac(&self, index: u16) -> MacAddress {
        if let Some(mac) = self.talker(index).and_then(|t| t.dest_mac) {
            return mac;
        }
        let hash = rotating_hash(0, &self.entity_id.0.to_be_bytes());
        let mut mac = MacAddress::STREAM_POOL_BASE;
        mac.0[5] = rotating_hash(hash, &index.to_be_bytes());
        mac
    }

    fn identify_control_index(&self) -> Option<u16> {
        self.config
            .controls
            .iter()
            .position(|c| c.control_type == IDENTIFY_CONTROL_TYPE)
            .and_then(|i| u16::try_from(i).ok())
    }

    fn entity_capabilities(&self) -> EntityCapabilities {
        let mut caps = EntityCapabilities::AEM_SUPPORTED
            | EntityCapabilities::VENDOR_UNIQUE_SUPPORTED
            | EntityCapabilities::GPTP_SUPPORTED
            | EntityCapabilities::AEM_INTERFACE_INDEX_VALID;
        if self.identify_control_index().is_some() {
            caps |= EntityCapabilities::AEM_IDENTIFY_CONTROL_INDEX_VALID;
        }
        if self.config.association_id.is_some() {
            caps |= EntityCapabilities::ASSOCIATION_ID_SUPPORTED
                | EntityCapabilities::ASSOCIATION_ID_VALID;
        }
        if self.talker_count() > 0 || self.listener_count() > 0 {
            caps |= EntityCapabilities::CLASS_A_SUPPORTED;
        }
        if self.config.talker_streams.iter().any(|t| t.class_b) {
            caps |= EntityCapabilities::CLASS_B_SUPPORTED;
        }
        caps
    }

    fn talker_capabilities(&self) -> TalkerCapabilities {
        if self.talker_count() == 0 {
            TalkerCapabilities::NONE
        } else {
            TalkerCapabilities::IMPLEMENTED | TalkerCapabilities::AUDIO_SOURCE
        }
    }

    fn listener_capabilities(&self) -> ListenerCapabilities {
        if self.listener_count() == 0 {
            ListenerCapabilities::NONE
        } else {
            ListenerCapabilities::IMPLEMENTED | ListenerCapabilities::AUDIO_SINK
        }
    }

    fn controller_capabilities(&self) -> ControllerCapabilities {
        if self.config.controller {
            ControllerCapabilities::IMPLEMENTED
        } else {
            ControllerCapabilities::NONE
        }
    }

    /// Advertisement contents
    #[must_use]
    pub fn info(&self, gptp: GptpInfo, valid_time: Duration) -> EntityInfo {
        EntityInfo {
            entity_id: self.entity_id,
            entity_model_id: self.config.entity_model_id,
            entity_capabilities: self.entity_capabilities(),
            talker_stream_sources: self.talker_count(),
            talker_capabilities: self.talker_capabilities(),
            listener_stream_sinks: self.listener_count(),
            listener_capabilities: self.listener_capabilities(),
            controller_capabilities: self.controller_capabilities(),
            available_index: self.available_index,
            gptp_grandmaster_id: gptp.grandmaster_id,
            gptp_domain_number: gptp.domain_number,
            identify_control_index: self.identify_control_index().unwrap_or(0),
            interface_index: 0,
            association_id: self.config.association_id.unwrap_or(0),
            valid_time,
        }
    }

    /// Descriptor `reference` of configuration 0
    #[must_use]
    pub fn descriptor(&self, reference: DescriptorRef, gptp: GptpInfo) -> Option<Descriptor> {
        let index = reference.descriptor_index;
        let body = match reference.descriptor_type {
            DescriptorType::Entity if index == 0 => DescriptorBody::Entity(self.entity_descriptor()),
            DescriptorType::Configuration if index == 0 => {
                DescriptorBody::Configuration(self.configuration_descriptor())
            }
            DescriptorType::StreamOutput => {
                let talker = self.talker(index)?;
                let class = if talker.class_b {
                    StreamDescriptor::FLAG_CLASS_B
                } else {
                    StreamDescriptor::FLAG_CLASS_A
                };
                DescriptorBody::StreamOutput(self.stream_descriptor(
                    StreamHandle::output(index),
                    &talker.name,
                    class,
                )?)
            }
            DescriptorType::StreamInput => {
                let listener = self.listener(index)?;
                DescriptorBody::StreamInput(self.stream_descriptor(
                    StreamHandle::input(index),
                    &listener.name,
                    StreamDescriptor::FLAG_CLASS_A | StreamDescriptor::FLAG_CLASS_B,
                )?)
            }
            DescriptorType::AvbInterface if index == 0 => {
                DescriptorBody::AvbInterface(self.avb_interface_descriptor(gptp))
            }
            DescriptorType::Control => DescriptorBody::Control(self.control_descriptor(index)?),
            DescriptorType::ClockDomain if index == 0 => {
                DescriptorBody::ClockDomain(ClockDomainDescriptor {
                    object_name: self.clock_domain_name.clone(),
                    localized_description: NO_STRING,
                    clock_source_index: 0,
                    clock_sources: Vec::new(),
                })
            }
            _ => return None,
        };
        Some(Descriptor {
            descriptor_index: index,
            body,
        })
    }

    fn entity_descriptor(&self) -> EntityDescriptor {
        EntityDescriptor {
            entity_id: self.entity_id,
            entity_model_id: self.config.entity_model_id,
            entity_capabilities: self.entity_capabilities(),
            talker_stream_sources: self.talker_count(),
            talker_capabilities: self.talker_capabilities(),
            listener_stream_sinks: self.listener_count(),
            listener_capabilities: self.listener_capabilities(),
            controller_capabilities: self.controller_capabilities(),
            available_index: self.available_index,
            association_id: self.config.association_id.unwrap_or(0),
            entity_name: self.config.entity_name.clone(),
            vendor_name_string: NO_STRING,
            model_name_string: NO_STRING,
            firmware_version: self.config.firmware_version.clone(),
            group_name: self.config.group_name.clone(),
            serial_number: self.config.serial_number.clone(),
            configurations_count: 1,
            current_configuration: 0,
        }
    }

    fn configuration_descriptor(&self) -> ConfigurationDescriptor {
        let counts = [
            (DescriptorType::StreamInput, self.listener_count()),
            (DescriptorType::StreamOutput, self.talker_count()),
            (DescriptorType::AvbInterface, 1),
            (DescriptorType::Control, self.control_count()),
            (DescriptorType::ClockDomain, 1),
        ];
        ConfigurationDescriptor {
            object_name: self.configuration_name.clone(),
            localized_description: NO_STRING,
            descriptor_counts: counts.into_iter().filter(|(_, n)| *n > 0).collect(),
        }
    }

    fn avb_interface_descriptor(&self, gptp: GptpInfo) -> AvbInterfaceDescriptor {
        AvbInterfaceDescriptor {
            object_name: self.interface_name.clone(),
            localized_description: NO_STRING,
            mac_address: self.mac_address,
            interface_flags: AVB_INTERFACE_GPTP_SUPPORTED | AVB_INTERFACE_SRP_SUPPORTED,
            clock_identity: self.entity_id.0,
            priority1: 248,
            clock_class: 248,
            offset_scaled_log_variance: 0x4100,
            clock_accuracy: 0xFE,
            priority2: 248,
            domain_number: gptp.domain_number,
            log_sync_interval: -3,
            log_announce_interval: 0,
            log_pdelay_interval: 0,
            port_number: 1,
        }
    }

    fn control_descriptor(&self, index: u16) -> Option<ControlDescriptor> {
        let control = self.config.controls.get(usize::from(index))?;
        let current = *self.control_values.get(usize::from(index))?;
        Some(ControlDescriptor {
            object_name: control.name.clone(),
            localized_description: NO_STRING,
            block_latency: 0,
            control_latency: 0,
            control_domain: 0,
            read_only: control.read_only,
            control_type: control.control_type,
            reset_time: 0,
            signal_type: 0xFFFF,
            signal_index: 0,
            signal_output: 0,
            values: vec![LinearU8Value {
                minimum: control.min,
                maximum: control.max,
                step: control.step,
                default: control.default,
                current,
                unit: 0,
                string: NO_STRING,
            }],
        })
    }

    /// Current value bytes of control `index`
    #[must_use]
    pub fn control_values(&self, index: u16) -> Option<Bytes> {
        self.control_values
            .get(usize::from(index))
            .map(|v| Bytes::copy_from_slice(&[*v]))
    }

    /// Apply a SET_CONTROL request.
    ///
    /// # Errors
    ///
    /// `NoSuchDescriptor` for an unknown control, `NotSupported` for a
    /// read-only one and `BadArguments` when the value is off-range or
    /// off-step.
    pub fn set_control(&mut self, index: u16, values: &[u8]) -> Result<Bytes, AecpStatus> {
        let control = self
            .config
            .controls
            .get(usize::from(index))
            .ok_or(AecpStatus::NoSuchDescriptor)?;
        if control.read_only {
            return Err(AecpStatus::NotSupported);
        }
        let [value] = values else {
            return Err(AecpStatus::BadArguments);
        };
        let range = LinearU8Value {
            minimum: control.min,
            maximum: control.max,
            step: control.step,
            default: control.default,
            current: *value,
            unit: 0,
            string: NO_STRING,
        };
        if !range.accepts(*value) {
            return Err(AecpStatus::BadArguments);
        }
        let slot = self
            .control_values
            .get_mut(usize::from(index))
            .ok_or(AecpStatus::NoSuchDescriptor)?;
        if *slot != *value {
            info!(control_index = index, value, "control changed");
            *slot = *value;
        }
        Ok(Bytes::copy_from_slice(&[*value]))
    }

    /// Whether `handle` names a configured stream
    #[must_use]
    pub fn has_stream(&self, handle: StreamHandle) -> bool {
        match handle.direction {
            StreamDirection::Input => handle.index < self.listener_count(),
            StreamDirection::Output => handle.index < self.talker_count(),
        }
    }

    /// Whether the stream was started by START_STREAMING
    #[must_use]
    pub fn is_running(&self, handle: StreamHandle) -> bool {
        self.running.contains(&handle)
    }

    /// Record the running state; returns whether it changed
    pub fn set_running(&mut self, handle: StreamHandle, running: bool) -> bool {
        if running {
            self.running.insert(handle)
        } else {
            self.running.remove(&handle)
        }
    }

    fn stream_descriptor(
        &self,
        handle: StreamHandle,
        name: &str,
        flags: u16,
    ) -> Option<StreamDescriptor> {
        Some(StreamDescriptor {
            object_name: name.to_string(),
            localized_description: NO_STRING,
            clock_domain_index: 0,
            stream_flags: flags,
            current_format: self.stream_format(handle)?,
            backup_talkers: [(EntityId::NONE, 0); 3],
            backedup_talker: (EntityId::NONE, 0),
            avb_interface_index: 0,
            buffer_length: 0,
            formats: self.supported_formats(handle),
        })
    }

    /// Current format of a stream
    #[must_use]
    pub fn stream_format(&self, handle: StreamHandle) -> Option<u64> {
        let formats = match handle.direction {
            StreamDirection::Input => &self.listener_formats,
            StreamDirection::Output => &self.talker_formats,
        };
        formats.get(usize::from(handle.index)).copied()
    }

    /// Formats a stream accepts, configured format first
    #[must_use]
    pub fn supported_formats(&self, handle: StreamHandle) -> Vec<u64> {
        let configured = match handle.direction {
            StreamDirection::Input => self
                .listener(handle.index)
                .map(|l| (l.format, l.alternate_formats.as_slice())),
            StreamDirection::Output => self
                .talker(handle.index)
                .map(|t| (t.format, t.alternate_formats.as_slice())),
        };
        let Some((format, alternates)) = configured else {
            return Vec::new();
        };
        let mut formats = vec![format];
        for alternate in alternates {
            if !formats.contains(alternate) {
                formats.push(*alternate);
            }
        }
        formats
    }

    /// Apply a SET_STREAM_FORMAT request; returns whether the format changed.
    ///
    /// # Errors
    ///
    /// `NoSuchDescriptor` for an unknown stream, `StreamIsRunning` while
    /// the stream is started and `NotSupported` for a format outside its
    /// list.
    pub fn set_stream_format(
        &mut self,
        handle: StreamHandle,
        format: u64,
    ) -> Result<bool, AecpStatus> {
        let current = self
            .stream_format(handle)
            .ok_or(AecpStatus::NoSuchDescriptor)?;
        if self.is_running(handle) {
            return Err(AecpStatus::StreamIsRunning);
        }
        if !self.supported_formats(handle).contains(&format) {
            return Err(AecpStatus::NotSupported);
        }
        if current == format {
            return Ok(false);
        }
        let formats = match handle.direction {
            StreamDirection::Input => &mut self.listener_formats,
            StreamDirection::Output => &mut self.talker_formats,
        };
        let slot = formats
            .get_mut(usize::from(handle.index))
            .ok_or(AecpStatus::NoSuchDescriptor)?;
        *slot = format;
        info!(stream = ?handle, format, "stream format changed");
        Ok(true)
    }

    fn name_slot(
        &self,
        descriptor: DescriptorRef,
        name_index: u16,
    ) -> Result<NameSlot, AecpStatus> {
        let index = usize::from(descriptor.descriptor_index);
        let (slot, exists) = match descriptor.descriptor_type {
            DescriptorType::Entity => match name_index {
                0 => (NameSlot::Entity, index == 0),
                1 => (NameSlot::Group, index == 0),
                _ => return Err(AecpStatus::BadArguments),
            },
            DescriptorType::Configuration => (NameSlot::Configuration, index == 0),
            DescriptorType::StreamOutput => {
                (NameSlot::Talker(index), index < self.config.talker_streams.len())
            }
            DescriptorType::StreamInput => {
                (NameSlot::Listener(index), index < self.config.listener_streams.len())
            }
            DescriptorType::AvbInterface => (NameSlot::Interface, index == 0),
            DescriptorType::ClockDomain => (NameSlot::ClockDomain, index == 0),
            DescriptorType::Control => {
                (NameSlot::Control(index), index < self.config.controls.len())
            }
            _ => return Err(AecpStatus::BadArguments),
        };
        if exists {
            Ok(slot)
        } else {
            Err(AecpStatus::NoSuchDescriptor)
        }
    }

    fn name_mut(&mut self, slot: NameSlot) -> Option<&mut String> {
        match slot {
            NameSlot::Entity => Some(&mut self.config.entity_name),
            NameSlot::Group => Some(&mut self.config.group_name),
            NameSlot::Configuration => Some(&mut self.configuration_name),
            NameSlot::Talker(i) => self.config.talker_streams.get_mut(i).map(|t| &mut t.name),
            NameSlot::Listener(i) => self.config.listener_streams.get_mut(i).map(|l| &mut l.name),
            NameSlot::Interface => Some(&mut self.interface_name),
            NameSlot::ClockDomain => Some(&mut self.clock_domain_name),
            NameSlot::Control(i) => self.config.controls.get_mut(i).map(|c| &mut c.name),
        }
    }

    /// Name `name_index` of a descriptor.
    ///
    /// # Errors
    ///
    /// `NoSuchDescriptor` for an unknown descriptor and `BadArguments` for a
    /// type without names or an ENTITY name index above 1.
    pub fn name(&self, descriptor: DescriptorRef, name_index: u16) -> Result<&str, AecpStatus> {
        let name = match self.name_slot(descriptor, name_index)? {
            NameSlot::Entity => Some(&self.config.entity_name),
            NameSlot::Group => Some(&self.config.group_name),
            NameSlot::Configuration => Some(&self.configuration_name),
            NameSlot::Talker(i) => self.config.talker_streams.get(i).map(|t| &t.name),
            NameSlot::Listener(i) => self.config.listener_streams.get(i).map(|l| &l.name),
            NameSlot::Interface => Some(&self.interface_name),
            NameSlot::ClockDomain => Some(&self.clock_domain_name),
            NameSlot::Control(i) => self.config.controls.get(i).map(|c| &c.name),
        };
        name.map(String::as_str).ok_or(AecpStatus::NoSuchDescriptor)
    }

    /// Apply a SET_NAME request; returns whether the name changed.
    ///
    /// # Errors
    ///
    /// As [`name`](Self::name).
    pub fn set_name(
        &mut self,
        descriptor: DescriptorRef,
        name_index: u16,
        name: &str,
    ) -> Result<bool, AecpStatus> {
        let slot = self.name_slot(descriptor, name_index)?;
        let slot = self.name_mut(slot).ok_or(AecpStatus::NoSuchDescriptor)?;
        if slot == name {
            return Ok(false);
        }
        *slot = name.to_string();
        info!(%descriptor, name_index, name, "name changed");
        Ok(true)
    }
}
