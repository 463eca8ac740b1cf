//! AECP engines.
//!
//! [`AecpResponder`] answers commands addressed to the local entity and
//! keeps its acquire, lock and notification state. [`AecpController`]
//! tracks the commands this stack sends to other entities.

use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::acmp::AcmpEngine;
use super::entity_model::LocalEntity;
use super::{InterfaceCounters, Reply, send_reply};
use crate::error::AvdeccError;
use crate::net::{GptpInfo, StreamDirection, StreamHandle, StreamingBackend};
use crate::protocol::aecp::{
    AecpBody, AecpMessageType, AecpPdu, AecpStatus, AemCommandType, MilanInfo, MvuCommandType,
};
use crate::protocol::aem::{
    AcquireFlags, AvbInfo, COUNTER_COUNT, ControlPayload, CountersResponse, DescriptorRef,
    DescriptorType, LockFlags, MsrpMapping, NamePayload, OwnershipPayload, ReadDescriptorCommand,
    ReadDescriptorResponse, StreamFormatPayload, StreamInfo, StreamInfoFlags, avb_info_flags,
};
use crate::protocol::avtp::MAX_CONTROL_DATA_LENGTH;
use crate::state::AvdeccEvent;
use crate::transaction::{Completion, Expiry, TransactionHandle, TransactionTracker};
use crate::types::{EntityId, MacAddress};

/// Controllers that can register for unsolicited notifications
pub const MAX_REGISTRATIONS: usize = 16;

/// Milan protocol version answered to GET_MILAN_INFO
const MILAN_PROTOCOL_VERSION: u32 = 1;

/// SR class A mapping reported by GET_AVB_INFO in Milan mode
const SR_CLASS_A_MAPPING: MsrpMapping = MsrpMapping {
    traffic_class: 6,
    priority: 3,
    vlan_id: 2,
};

/// Everything a command handler may read or change
pub struct ResponderContext<'a> {
    /// Local entity model
    pub entity: &'a mut LocalEntity,
    /// Data plane
    pub streaming: &'a mut dyn StreamingBackend,
    /// Connection state, for stream parameters
    pub acmp: &'a AcmpEngine,
    /// Current grandmaster
    pub gptp: GptpInfo,
    /// AVB_INTERFACE counters
    pub counters: InterfaceCounters,
    /// Current time
    pub now: Instant,
}

/// Result of handling one command
#[derive(Debug)]
pub struct ResponderOutput {
    /// Response to the issuing controller
    pub response: AecpPdu,
    /// Unsolicited copies for the other registered controllers
    pub notifications: Vec<(MacAddress, AecpPdu)>,
    /// Events for the application
    pub events: Vec<AvdeccEvent>,
}

#[derive(Debug, Clone, Copy)]
struct Acquisition {
    controller: EntityId,
    persistent: bool,
}

#[derive(Debug, Clone, Copy)]
struct Lock {
    controller: EntityId,
    expires: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    controller: EntityId,
    mac: MacAddress,
    sequence_id: u16,
}

/// Status, payload and whether the entity state changed
type Handled = (AecpStatus, Bytes, bool);

/// Answers AECP commands for the local entity
#[derive(Debug)]
pub struct AecpResponder {
    local_id: EntityId,
    milan_mode: bool,
    lock_timeout: Duration,
    acquired: Option<Acquisition>,
    lock: Option<Lock>,
    registrations: Vec<Registration>,
}

impl AecpResponder {
    /// Responder for `local_id`; locks expire after `lock_timeout`
    #[must_use]
    pub fn new(local_id: EntityId, lock_timeout: Duration, milan_mode: bool) -> Self {
        Self {
            local_id,
            milan_mode,
            lock_timeout,
            acquired: None,
            lock: None,
            registrations: Vec::new(),
        }
    }

    /// Controller that acquired the entity
    #[must_use]
    pub fn acquired_by(&self) -> Option<EntityId> {
        self.acquired.map(|a| a.controller)
    }

    /// Controller holding the lock
    #[must_use]
    pub fn locked_by(&self) -> Option<EntityId> {
        self.lock.map(|l| l.controller)
    }

    /// Controllers registered for unsolicited notifications
    #[must_use]
    pub fn registered_controllers(&self) -> Vec<EntityId> {
        self.registrations.iter().map(|r| r.controller).collect()
    }

    /// When the lock expires
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock.map(|l| l.expires)
    }

    fn ownership(&self) -> (Option<EntityId>, Option<EntityId>) {
        (self.acquired_by(), self.locked_by())
    }

    fn ownership_event(&self) -> AvdeccEvent {
        AvdeccEvent::OwnershipChanged {
            acquired_by: self.acquired_by(),
            locked_by: self.locked_by(),
        }
    }

    fn expire_lock(&mut self, now: Instant) -> bool {
        match self.lock {
            Some(lock) if lock.expires <= now => {
                info!(controller = %lock.controller, "entity lock expired");
                self.lock = None;
                true
            }
            _ => false,
        }
    }

    /// Release an expired lock
    pub fn poll(&mut self, now: Instant) -> Option<AvdeccEvent> {
        self.expire_lock(now).then(|| self.ownership_event())
    }

    /// Drop state held by a controller that left the network.
    ///
    /// Persistent acquisitions survive.
    pub fn entity_departed(&mut self, entity_id: EntityId) -> Option<AvdeccEvent> {
        self.registrations.retain(|r| r.controller != entity_id);
        let before = self.ownership();
        if self
            .acquired
            .is_some_and(|a| a.controller == entity_id && !a.persistent)
        {
            info!(controller = %entity_id, "acquiring controller departed, entity released");
            self.acquired = None;
        }
        if self.lock.is_some_and(|l| l.controller == entity_id) {
            info!(controller = %entity_id, "locking controller departed, entity unlocked");
            self.lock = None;
        }
        (self.ownership() != before).then(|| self.ownership_event())
    }

    /// Handle one command addressed to the local entity
    pub fn handle_command(
        &mut self,
        command: &AecpPdu,
        source: MacAddress,
        ctx: &mut ResponderContext<'_>,
    ) -> ResponderOutput {
        let mut events = Vec::new();
        let before = self.ownership();
        self.expire_lock(ctx.now);
        let controller = command.controller_entity_id;

        let (status, payload, changed) = match &command.body {
            AecpBody::Aem {
                command_type,
                payload,
                ..
            } => {
                debug!(%controller, %command_type, "AEM command received");
                self.handle_aem(*command_type, payload, controller, source, ctx, &mut events)
            }
            AecpBody::Milan {
                command_type,
                payload,
            } => self.handle_milan(*command_type, payload),
            AecpBody::VendorUnique {
                protocol_id,
                payload,
            } => {
                debug!(protocol_id, "unsupported vendor unique protocol");
                (AecpStatus::NotImplemented, payload.clone(), false)
            }
            AecpBody::Other { payload } => {
                debug!(message_type = ?command.message_type, "unsupported AECP message type");
                (AecpStatus::NotImplemented, payload.clone(), false)
            }
        };

        if self.ownership() != before {
            events.push(self.ownership_event());
        }
        let response = command.to_response(status, payload);
        let notifications = if changed && status.is_success() {
            self.unsolicited(&response, controller)
        } else {
            Vec::new()
        };
        ResponderOutput {
            response,
            notifications,
            events,
        }
    }

    fn handle_aem(
        &mut self,
        command_type: AemCommandType,
        payload: &Bytes,
        controller: EntityId,
        source: MacAddress,
        ctx: &mut ResponderContext<'_>,
        events: &mut Vec<AvdeccEvent>,
    ) -> Handled {
        match command_type {
            AemCommandType::ACQUIRE_ENTITY => self.acquire(payload, controller),
            AemCommandType::LOCK_ENTITY => self.lock(payload, controller, ctx.now),
            AemCommandType::ENTITY_AVAILABLE | AemCommandType::CONTROLLER_AVAILABLE => {
                (AecpStatus::Success, payload.clone(), false)
            }
            AemCommandType::READ_DESCRIPTOR => read_descriptor(payload, ctx),
            AemCommandType::SET_CONFIGURATION => self.set_configuration(payload, controller, ctx),
            AemCommandType::GET_CONFIGURATION => {
                (AecpStatus::Success, configuration_payload(0), false)
            }
            AemCommandType::SET_STREAM_FORMAT => {
                self.set_stream_format(payload, controller, ctx, events)
            }
            AemCommandType::GET_STREAM_FORMAT => get_stream_format(payload, ctx),
            AemCommandType::GET_STREAM_INFO => get_stream_info(payload, ctx),
            AemCommandType::SET_NAME => self.set_name(payload, controller, ctx, events),
            AemCommandType::GET_NAME => get_name(payload, ctx),
            AemCommandType::SET_CONTROL => self.set_control(payload, controller, ctx, events),
            AemCommandType::GET_CONTROL => get_control(payload, ctx),
            AemCommandType::START_STREAMING => {
                self.streaming(true, payload, controller, ctx, events)
            }
            AemCommandType::STOP_STREAMING => {
                self.streaming(false, payload, controller, ctx, events)
            }
            AemCommandType::REGISTER_UNSOLICITED_NOTIFICATION => {
                self.register(payload, controller, source)
            }
            AemCommandType::DEREGISTER_UNSOLICITED_NOTIFICATION => {
                self.registrations.retain(|r| r.controller != controller);
                info!(%controller, "controller deregistered from notifications");
                (AecpStatus::Success, payload.clone(), false)
            }
            AemCommandType::GET_AVB_INFO => get_avb_info(payload, ctx, self.milan_mode),
            AemCommandType::GET_COUNTERS => get_counters(payload, ctx),
            other => {
                debug!(command_type = %other, "AEM command not implemented");
                (AecpStatus::NotImplemented, payload.clone(), false)
            }
        }
    }

    fn handle_milan(&self, command_type: MvuCommandType, payload: &Bytes) -> Handled {
        if self.milan_mode && command_type == MvuCommandType::GET_MILAN_INFO {
            let info = MilanInfo {
                protocol_version: MILAN_PROTOCOL_VERSION,
                features_flags: 0,
                certification_version: 0,
            };
            return (AecpStatus::Success, info.encode(), false);
        }
        (AecpStatus::NotImplemented, payload.clone(), false)
    }

    /// `Err` with the refusal status when another controller holds the entity
    fn check_access(&self, controller: EntityId) -> Result<(), AecpStatus> {
        if self.acquired.is_some_and(|a| a.controller != controller) {
            return Err(AecpStatus::EntityAcquired);
        }
        if self.lock.is_some_and(|l| l.controller != controller) {
            return Err(AecpStatus::EntityLocked);
        }
        Ok(())
    }

    fn acquire(&mut self, payload: &Bytes, controller: EntityId) -> Handled {
        if self.milan_mode {
            return (AecpStatus::NotImplemented, payload.clone(), false);
        }
        let Ok(request) = OwnershipPayload::decode(payload) else {
            return (AecpStatus::BadArguments, payload.clone(), false);
        };
        let reply = |status: AecpStatus, owner_id: EntityId, changed: bool| {
            let payload = OwnershipPayload { owner_id, ..request }.encode();
            (status, payload, changed)
        };
        if request.descriptor.descriptor_type != DescriptorType::Entity {
            return reply(AecpStatus::BadArguments, EntityId::NONE, false);
        }
        if let Some(owner) = self.acquired.filter(|a| a.controller != controller) {
            return reply(AecpStatus::EntityAcquired, owner.controller, false);
        }

        let flags = AcquireFlags(request.flags);
        if flags.contains(AcquireFlags::RELEASE) {
            let changed = self.acquired.take().is_some();
            if changed {
                info!(%controller, "entity released");
            }
            return reply(AecpStatus::Success, EntityId::NONE, changed);
        }
        let changed = self.acquired.is_none();
        self.acquired = Some(Acquisition {
            controller,
            persistent: flags.contains(AcquireFlags::PERSISTENT),
        });
        if changed {
            info!(%controller, "entity acquired");
        }
        reply(AecpStatus::Success, controller, changed)
    }

    fn lock(&mut self, payload: &Bytes, controller: EntityId, now: Instant) -> Handled {
        let Ok(request) = OwnershipPayload::decode(payload) else {
            return (AecpStatus::BadArguments, payload.clone(), false);
        };
        let reply = |status: AecpStatus, owner_id: EntityId, changed: bool| {
            let payload = OwnershipPayload { owner_id, ..request }.encode();
            (status, payload, changed)
        };
        if request.descriptor.descriptor_type != DescriptorType::Entity {
            return reply(AecpStatus::NotSupported, EntityId::NONE, false);
        }
        if let Some(lock) = self.lock.filter(|l| l.controller != controller) {
            return reply(AecpStatus::EntityLocked, lock.controller, false);
        }

        if LockFlags(request.flags).contains(LockFlags::UNLOCK) {
            let changed = self.lock.take().is_some();
            if changed {
                info!(%controller, "entity unlocked");
            }
            return reply(AecpStatus::Success, EntityId::NONE, changed);
        }
        let changed = self.lock.is_none();
        self.lock = Some(Lock {
            controller,
            expires: now + self.lock_timeout,
        });
        if changed {
            info!(%controller, timeout = ?self.lock_timeout, "entity locked");
        }
        reply(AecpStatus::Success, controller, changed)
    }

    fn set_control(
        &mut self,
        payload: &Bytes,
        controller: EntityId,
        ctx: &mut ResponderContext<'_>,
        events: &mut Vec<AvdeccEvent>,
    ) -> Handled {
        let Ok(request) = ControlPayload::decode(payload) else {
            return (AecpStatus::BadArguments, payload.clone(), false);
        };
        let index = request.descriptor.descriptor_index;
        let current = match request.descriptor.descriptor_type {
            DescriptorType::Control => ctx.entity.control_values(index),
            _ => None,
        };
        let Some(current) = current else {
            return (AecpStatus::NoSuchDescriptor, payload.clone(), false);
        };
        let respond = |status: AecpStatus, values: Bytes, changed: bool| {
            let payload = ControlPayload {
                descriptor: request.descriptor,
                values,
            }
            .encode();
            (status, payload, changed)
        };

        if let Err(status) = self.check_access(controller) {
            return respond(status, current, false);
        }
        match ctx.entity.set_control(index, &request.values) {
            Ok(values) => {
                if values != current {
                    events.push(AvdeccEvent::ControlChanged {
                        control_index: index,
                        values: values.clone(),
                    });
                }
                respond(AecpStatus::Success, values, true)
            }
            Err(status) => respond(status, current, false),
        }
    }

    fn streaming(
        &mut self,
        start: bool,
        payload: &Bytes,
        controller: EntityId,
        ctx: &mut ResponderContext<'_>,
        events: &mut Vec<AvdeccEvent>,
    ) -> Handled {
        let Ok(descriptor) = DescriptorRef::decode(payload) else {
            return (AecpStatus::BadArguments, payload.clone(), false);
        };
        let Some(handle) = stream_handle(descriptor).filter(|h| ctx.entity.has_stream(*h)) else {
            return (AecpStatus::NoSuchDescriptor, payload.clone(), false);
        };
        if let Err(status) = self.check_access(controller) {
            return (status, payload.clone(), false);
        }

        let result = if start {
            match ctx.acmp.stream_params(handle, ctx.entity) {
                Some(params) => ctx.streaming.start_stream(&params),
                None => Err(AecpStatus::NoSuchDescriptor),
            }
        } else {
            ctx.streaming.stop_stream(handle)
        };
        if let Err(status) = result {
            warn!(%descriptor, %status, start, "streaming backend refused");
            return (status, payload.clone(), false);
        }
        if ctx.entity.set_running(handle, start) {
            info!(%descriptor, running = start, "streaming state changed");
            events.push(AvdeccEvent::StreamingChanged {
                handle,
                running: start,
            });
        }
        (AecpStatus::Success, payload.clone(), true)
    }

    fn set_configuration(
        &self,
        payload: &Bytes,
        controller: EntityId,
        ctx: &ResponderContext<'_>,
    ) -> Handled {
        if payload.len() < 4 {
            return (AecpStatus::BadArguments, payload.clone(), false);
        }
        let requested = u16::from_be_bytes([payload[2], payload[3]]);
        let current = configuration_payload(0);
        if let Err(status) = self.check_access(controller) {
            return (status, current, false);
        }
        if any_stream_active(ctx) {
            return (AecpStatus::StreamIsRunning, current, false);
        }
        // Only configuration 0 exists
        let status = if requested == 0 {
            AecpStatus::Success
        } else {
            AecpStatus::NotSupported
        };
        (status, current, false)
    }

    fn set_stream_format(
        &mut self,
        payload: &Bytes,
        controller: EntityId,
        ctx: &mut ResponderContext<'_>,
        events: &mut Vec<AvdeccEvent>,
    ) -> Handled {
        let Ok(request) = StreamFormatPayload::decode(payload) else {
            return (AecpStatus::BadArguments, payload.clone(), false);
        };
        let Some(handle) = stream_handle(request.descriptor) else {
            return (AecpStatus::BadArguments, payload.clone(), false);
        };
        let Some(current) = ctx.entity.stream_format(handle) else {
            return (AecpStatus::NoSuchDescriptor, payload.clone(), false);
        };
        let respond = |status: AecpStatus, stream_format: u64, changed: bool| {
            let payload = StreamFormatPayload {
                descriptor: request.descriptor,
                stream_format,
            }
            .encode();
            (status, payload, changed)
        };

        if let Err(status) = self.check_access(controller) {
            return respond(status, current, false);
        }
        if ctx.acmp.is_connected(handle) {
            return respond(AecpStatus::StreamIsRunning, current, false);
        }
        match ctx.entity.set_stream_format(handle, request.stream_format) {
            Ok(changed) => {
                if changed {
                    events.push(AvdeccEvent::StreamFormatChanged {
                        handle,
                        format: request.stream_format,
                    });
                }
                respond(AecpStatus::Success, request.stream_format, changed)
            }
            Err(status) => respond(status, current, false),
        }
    }

    fn set_name(
        &mut self,
        payload: &Bytes,
        controller: EntityId,
        ctx: &mut ResponderContext<'_>,
        events: &mut Vec<AvdeccEvent>,
    ) -> Handled {
        let request = match NamePayload::decode(payload) {
            Ok(request) if NamePayload::has_name(payload) => request,
            _ => return (AecpStatus::BadArguments, payload.clone(), false),
        };
        if request.configuration_index != 0 {
            return (AecpStatus::NotSupported, payload.clone(), false);
        }
        let current = match ctx.entity.name(request.descriptor, request.name_index) {
            Ok(name) => name.to_string(),
            Err(status) => return (status, payload.clone(), false),
        };
        let respond = |status: AecpStatus, name: String, changed: bool| {
            let payload = NamePayload {
                name,
                ..request.clone()
            }
            .encode();
            (status, payload, changed)
        };

        if let Err(status) = self.check_access(controller) {
            return respond(status, current, false);
        }
        match ctx
            .entity
            .set_name(request.descriptor, request.name_index, &request.name)
        {
            Ok(changed) => {
                if changed {
                    events.push(AvdeccEvent::NameChanged {
                        descriptor: request.descriptor,
                        name_index: request.name_index,
                        name: request.name.clone(),
                    });
                }
                respond(AecpStatus::Success, request.name.clone(), changed)
            }
            Err(status) => respond(status, current, false),
        }
    }

    fn register(&mut self, payload: &Bytes, controller: EntityId, source: MacAddress) -> Handled {
        if let Some(registration) = self
            .registrations
            .iter_mut()
            .find(|r| r.controller == controller)
        {
            registration.mac = source;
            return (AecpStatus::Success, payload.clone(), false);
        }
        if self.registrations.len() >= MAX_REGISTRATIONS {
            warn!(%controller, "notification registrations full");
            return (AecpStatus::NoResources, payload.clone(), false);
        }
        self.registrations.push(Registration {
            controller,
            mac: source,
            sequence_id: 0,
        });
        info!(%controller, "controller registered for notifications");
        (AecpStatus::Success, payload.clone(), false)
    }

    /// Unsolicited copies of `response` for every registered controller
    /// except `originator`
    pub fn unsolicited(
        &mut self,
        response: &AecpPdu,
        originator: EntityId,
    ) -> Vec<(MacAddress, AecpPdu)> {
        let AecpBody::Aem {
            command_type,
            payload,
            ..
        } = &response.body
        else {
            return Vec::new();
        };
        let local_id = self.local_id;
        self.registrations
            .iter_mut()
            .filter(|r| r.controller != originator)
            .map(|r| {
                let sequence_id = r.sequence_id;
                r.sequence_id = r.sequence_id.wrapping_add(1);
                let pdu = AecpPdu {
                    message_type: AecpMessageType::AemResponse,
                    status: response.status,
                    target_entity_id: local_id,
                    controller_entity_id: r.controller,
                    sequence_id,
                    body: AecpBody::Aem {
                        unsolicited: true,
                        command_type: *command_type,
                        payload: payload.clone(),
                    },
                };
                (r.mac, pdu)
            })
            .collect()
    }
}

fn stream_handle(descriptor: DescriptorRef) -> Option<StreamHandle> {
    let direction = match descriptor.descriptor_type {
        DescriptorType::StreamInput => StreamDirection::Input,
        DescriptorType::StreamOutput => StreamDirection::Output,
        _ => return None,
    };
    Some(StreamHandle {
        direction,
        index: descriptor.descriptor_index,
    })
}

fn read_descriptor(payload: &Bytes, ctx: &ResponderContext<'_>) -> Handled {
    let Ok(request) = ReadDescriptorCommand::decode(payload) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    // Only configuration 0 exists; ENTITY ignores the configuration index
    if request.configuration_index != 0
        && request.descriptor.descriptor_type != DescriptorType::Entity
    {
        return (AecpStatus::NoSuchDescriptor, payload.clone(), false);
    }
    match ctx.entity.descriptor(request.descriptor, ctx.gptp) {
        Some(descriptor) => {
            let response = ReadDescriptorResponse {
                configuration_index: request.configuration_index,
                descriptor,
            };
            (AecpStatus::Success, response.encode(), false)
        }
        None => (AecpStatus::NoSuchDescriptor, payload.clone(), false),
    }
}

fn get_control(payload: &Bytes, ctx: &ResponderContext<'_>) -> Handled {
    let Ok(descriptor) = DescriptorRef::decode(payload) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    let values = match descriptor.descriptor_type {
        DescriptorType::Control => ctx.entity.control_values(descriptor.descriptor_index),
        _ => None,
    };
    match values {
        Some(values) => (
            AecpStatus::Success,
            ControlPayload { descriptor, values }.encode(),
            false,
        ),
        None => (AecpStatus::NoSuchDescriptor, payload.clone(), false),
    }
}

fn configuration_payload(configuration_index: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(0);
    buf.put_u16(configuration_index);
    buf.freeze()
}

/// Whether any local stream is started or connected
fn any_stream_active(ctx: &ResponderContext<'_>) -> bool {
    let inputs = (0..ctx.entity.listener_count()).map(StreamHandle::input);
    let outputs = (0..ctx.entity.talker_count()).map(StreamHandle::output);
    inputs
        .chain(outputs)
        .any(|h| ctx.entity.is_running(h) || ctx.acmp.is_connected(h))
}

fn get_stream_format(payload: &Bytes, ctx: &ResponderContext<'_>) -> Handled {
    let Ok(descriptor) = DescriptorRef::decode(payload) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    let Some(handle) = stream_handle(descriptor) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    match ctx.entity.stream_format(handle) {
        Some(stream_format) => {
            let response = StreamFormatPayload {
                descriptor,
                stream_format,
            };
            (AecpStatus::Success, response.encode(), false)
        }
        None => (AecpStatus::NoSuchDescriptor, payload.clone(), false),
    }
}

fn get_stream_info(payload: &Bytes, ctx: &ResponderContext<'_>) -> Handled {
    let Ok(descriptor) = DescriptorRef::decode(payload) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    let Some(handle) = stream_handle(descriptor) else {
        return (AecpStatus::BadArguments, StreamInfo::new(descriptor).encode(), false);
    };
    let Some(params) = ctx.acmp.stream_params(handle, ctx.entity) else {
        return (AecpStatus::NoSuchDescriptor, StreamInfo::new(descriptor).encode(), false);
    };

    let mut info = StreamInfo::new(descriptor);
    info.stream_format = params.format;
    info.flags |= StreamInfoFlags::STREAM_FORMAT_VALID;
    if params.class_b {
        info.flags |= StreamInfoFlags::CLASS_B;
    }
    let connected = ctx.acmp.is_connected(handle);
    if connected {
        info.flags |= StreamInfoFlags::CONNECTED;
        if !ctx.entity.is_running(handle) {
            info.flags |= StreamInfoFlags::STREAMING_WAIT;
        }
    }
    // A listener only knows its stream once connected; a talker always does
    if connected || handle.direction == StreamDirection::Output {
        info.stream_id = params.stream_id;
        info.stream_dest_mac = params.dest_mac;
        info.stream_vlan_id = params.vlan_id;
        info.flags |= StreamInfoFlags::STREAM_ID_VALID
            | StreamInfoFlags::STREAM_DEST_MAC_VALID
            | StreamInfoFlags::STREAM_VLAN_ID_VALID;
    }
    (AecpStatus::Success, info.encode(), false)
}

fn get_avb_info(payload: &Bytes, ctx: &ResponderContext<'_>, milan_mode: bool) -> Handled {
    let Ok(descriptor) = DescriptorRef::decode(payload) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    if descriptor.descriptor_type != DescriptorType::AvbInterface {
        return (AecpStatus::BadArguments, payload.clone(), false);
    }
    if descriptor.descriptor_index != 0 {
        return (AecpStatus::NoSuchDescriptor, payload.clone(), false);
    }
    let info = AvbInfo {
        descriptor,
        gptp_grandmaster_id: ctx.gptp.grandmaster_id,
        propagation_delay: 0,
        gptp_domain_number: ctx.gptp.domain_number,
        flags: avb_info_flags::AS_CAPABLE
            | avb_info_flags::GPTP_ENABLED
            | avb_info_flags::SRP_ENABLED,
        msrp_mappings: if milan_mode {
            vec![SR_CLASS_A_MAPPING]
        } else {
            Vec::new()
        },
    };
    (AecpStatus::Success, info.encode(), false)
}

fn get_name(payload: &Bytes, ctx: &ResponderContext<'_>) -> Handled {
    let Ok(request) = NamePayload::decode(payload) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    if request.configuration_index != 0 {
        return (AecpStatus::NotSupported, payload.clone(), false);
    }
    match ctx.entity.name(request.descriptor, request.name_index) {
        Ok(name) => {
            let response = NamePayload {
                name: name.to_string(),
                ..request
            };
            (AecpStatus::Success, response.encode(), false)
        }
        Err(status) => (status, payload.clone(), false),
    }
}

fn get_counters(payload: &Bytes, ctx: &ResponderContext<'_>) -> Handled {
    let Ok(descriptor) = DescriptorRef::decode(payload) else {
        return (AecpStatus::BadArguments, payload.clone(), false);
    };
    let counters = match descriptor.descriptor_type {
        DescriptorType::AvbInterface if descriptor.descriptor_index == 0 => {
            Some(ctx.counters.to_counters())
        }
        _ => stream_handle(descriptor)
            .filter(|h| ctx.entity.has_stream(*h))
            .map(|h| {
                ctx.streaming
                    .stream_counters(h)
                    .unwrap_or((0, [0; COUNTER_COUNT]))
            }),
    };
    match counters {
        Some((counters_valid, counters)) => {
            let response = CountersResponse {
                descriptor,
                counters_valid,
                counters,
            };
            (AecpStatus::Success, response.encode(), false)
        }
        None => (AecpStatus::NoSuchDescriptor, payload.clone(), false),
    }
}

#[derive(Debug)]
struct PendingCommand {
    command: AecpPdu,
    destination: MacAddress,
    reply: Reply<AecpPdu>,
}

/// What an inbound response did to the controller
#[derive(Debug)]
pub enum ControllerEvent {
    /// A pending command finished; its requester was answered
    Completed {
        /// Command as last sent
        command: AecpPdu,
        /// Matching response
        response: AecpPdu,
    },
    /// The target asked for more time
    InProgress,
    /// Unsolicited notification for the application
    Unsolicited(AvdeccEvent),
    /// Stale, duplicate or foreign response
    Ignored,
}

/// Outstanding AECP commands of the local controller
#[derive(Debug)]
pub struct AecpController {
    local_id: EntityId,
    timeout: Duration,
    retries: u8,
    tracker: TransactionTracker<PendingCommand>,
}

impl AecpController {
    /// Controller for `local_id` with at most `capacity` commands in flight
    #[must_use]
    pub fn new(local_id: EntityId, timeout: Duration, retries: u8, capacity: usize) -> Self {
        Self {
            local_id,
            timeout,
            retries,
            tracker: TransactionTracker::new("aecp", capacity),
        }
    }

    /// Commands in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Earliest retry or timeout
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tracker.next_deadline()
    }

    /// Register `command` for sending to `destination`.
    ///
    /// Returns the PDU to transmit with its sequence id filled in, or `None`
    /// when the payload is too large or the tracker is full; `reply` then
    /// already carries the error.
    pub(crate) fn begin(
        &mut self,
        mut command: AecpPdu,
        destination: MacAddress,
        reply: Reply<AecpPdu>,
        now: Instant,
    ) -> Option<(TransactionHandle, AecpPdu)> {
        if !command.fits() {
            let length = command.control_data_length();
            warn!(target = %command.target_entity_id, length, "AECP command too large");
            send_reply(
                reply,
                Err(AvdeccError::InvalidParameter {
                    name: "payload".into(),
                    message: format!(
                        "control data length {length} exceeds {MAX_CONTROL_DATA_LENGTH}"
                    ),
                }),
            );
            return None;
        }
        if self.tracker.is_full() {
            send_reply(
                reply,
                Err(AvdeccError::NoResources {
                    capacity: self.tracker.capacity(),
                }),
            );
            return None;
        }
        command.controller_entity_id = self.local_id;
        let target = command.target_entity_id;
        let pending = PendingCommand {
            command,
            destination,
            reply,
        };
        let (handle, sequence_id) = self
            .tracker
            .begin(target, self.timeout, self.retries, now, pending)
            .ok()?;
        let pending = self.tracker.context_mut(handle)?;
        pending.command.sequence_id = sequence_id;
        Some((handle, pending.command.clone()))
    }

    /// Abort a command whose frame could not be sent
    pub(crate) fn fail(&mut self, handle: TransactionHandle, error: AvdeccError) {
        if let Some(pending) = self.tracker.cancel(handle) {
            send_reply(pending.reply, Err(error));
        }
    }

    /// Process a response addressed to the local controller
    pub fn handle_response(&mut self, response: &AecpPdu, now: Instant) -> ControllerEvent {
        if response.controller_entity_id != self.local_id {
            return ControllerEvent::Ignored;
        }
        let target = response.target_entity_id;
        if let AecpBody::Aem {
            unsolicited: true,
            command_type,
            payload,
        } = &response.body
        {
            debug!(%target, %command_type, "unsolicited response");
            return ControllerEvent::Unsolicited(AvdeccEvent::UnsolicitedResponse {
                entity_id: target,
                command_type: *command_type,
                status: response.status,
                payload: payload.clone(),
            });
        }

        let sequence_id = response.sequence_id;
        if let Some((_, pending)) = self.tracker.lookup(target, sequence_id) {
            if !answers(&pending.command, response) {
                warn!(%target, sequence_id, "response does not match the pending command");
                return ControllerEvent::Ignored;
            }
        }
        if response.status == AecpStatus::InProgress {
            return if self.tracker.extend(target, sequence_id, now) {
                ControllerEvent::InProgress
            } else {
                ControllerEvent::Ignored
            };
        }
        match self.tracker.complete(target, sequence_id) {
            Completion::Matched { context, .. } => {
                let result = if response.status.is_success() {
                    Ok(response.clone())
                } else {
                    Err(AvdeccError::AecpStatus(response.status))
                };
                send_reply(context.reply, result);
                ControllerEvent::Completed {
                    command: context.command,
                    response: response.clone(),
                }
            }
            Completion::Duplicate | Completion::Unmatched => ControllerEvent::Ignored,
        }
    }

    /// Retry or time out expired commands; returns the frames to resend
    pub fn poll(&mut self, now: Instant) -> Vec<(MacAddress, AecpPdu)> {
        let mut resend = Vec::new();
        for expiry in self.tracker.poll_expired(now) {
            match expiry {
                Expiry::Retry {
                    handle,
                    sequence_id,
                    ..
                } => {
                    if let Some(pending) = self.tracker.context_mut(handle) {
                        pending.command.sequence_id = sequence_id;
                        resend.push((pending.destination, pending.command.clone()));
                    }
                }
                Expiry::TimedOut {
                    target, context, ..
                } => send_reply(context.reply, Err(AvdeccError::Timeout { target })),
            }
        }
        resend
    }

    /// Fail every command to an entity that left
    pub fn entity_departed(&mut self, entity_id: EntityId) {
        for (_, pending) in self.tracker.cancel_target(entity_id) {
            send_reply(
                pending.reply,
                Err(AvdeccError::EntityNotFound { entity_id }),
            );
        }
    }

    /// Fail every outstanding command with `Cancelled`
    pub fn cancel_all(&mut self) {
        for handle in self.tracker.handles() {
            if let Some(pending) = self.tracker.cancel(handle) {
                send_reply(pending.reply, Err(AvdeccError::Cancelled));
            }
        }
    }
}

/// Whether `response` answers `command`
fn answers(command: &AecpPdu, response: &AecpPdu) -> bool {
    if response.message_type != command.message_type.response() {
        return false;
    }
    match (&command.body, &response.body) {
        (AecpBody::Aem { command_type: a, .. }, AecpBody::Aem { command_type: b, .. }) => a == b,
        (AecpBody::Milan { command_type: a, .. }, AecpBody::Milan { command_type: b, .. }) => {
            a == b
        }
        (
            AecpBody::VendorUnique { protocol_id: a, .. },
            AecpBody::VendorUnique { protocol_id: b, .. },
        ) => a == b,
        (AecpBody::Other { .. }, AecpBody::Other { .. }) => true,
        _ => false,
    }
}
