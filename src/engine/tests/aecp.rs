use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::engine::{
    AcmpEngine, AecpController, AecpResponder, ControllerEvent, InterfaceCounters, LocalEntity,
    ResponderContext, ResponderOutput,
};
use crate::error::{AvdeccError, Result};
use crate::net::{GptpInfo, StreamHandle};
use crate::protocol::aecp::{
    AecpBody, AecpMessageType, AecpPdu, AecpStatus, AemCommandType, MilanInfo, MvuCommandType,
};
use crate::protocol::aem::{
    AcquireFlags, AvbInfo, ControlPayload, CountersResponse, DescriptorBody, DescriptorRef,
    DescriptorType, LockFlags, NamePayload, OwnershipPayload, ReadDescriptorCommand,
    ReadDescriptorResponse, StreamFormatPayload, StreamInfo, StreamInfoFlags,
    avb_info_flags, avb_interface_counters,
};
use crate::state::AvdeccEvent;
use crate::testing::{
    RecordingStreaming, StreamingFaults, listener_config, talker_config, test_mac,
};
use crate::types::{AvdeccConfig, EntityId, MacAddress};

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const AECP_TIMEOUT: Duration = Duration::from_millis(250);

const CONTROLLER_A: EntityId = EntityId(0x0A);
const CONTROLLER_B: EntityId = EntityId(0x0B);
const CONTROLLER_C: EntityId = EntityId(0x0C);

struct Fixture {
    responder: AecpResponder,
    entity: LocalEntity,
    streaming: RecordingStreaming,
    acmp: AcmpEngine,
    counters: InterfaceCounters,
    now: Instant,
}

impl Fixture {
    fn new(milan_mode: bool) -> Self {
        Self::with_config(&talker_config(1), milan_mode)
    }

    fn with_config(config: &AvdeccConfig, milan_mode: bool) -> Self {
        let entity = LocalEntity::new(config);
        let local_id = entity.entity_id();
        Self {
            responder: AecpResponder::new(local_id, LOCK_TIMEOUT, milan_mode),
            entity,
            streaming: RecordingStreaming::new(),
            acmp: AcmpEngine::new(local_id, 2, 8, false),
            counters: InterfaceCounters::default(),
            now: Instant::now(),
        }
    }

    fn local_id(&self) -> EntityId {
        self.entity.entity_id()
    }

    fn send(&mut self, command: &AecpPdu) -> ResponderOutput {
        let source = test_mac(u8::try_from(command.controller_entity_id.0 & 0xFF).unwrap());
        let mut ctx = ResponderContext {
            entity: &mut self.entity,
            streaming: &mut self.streaming,
            acmp: &self.acmp,
            gptp: GptpInfo::default(),
            counters: self.counters,
            now: self.now,
        };
        self.responder.handle_command(command, source, &mut ctx)
    }

    fn aem(&self, controller: EntityId, command_type: AemCommandType, payload: Bytes) -> AecpPdu {
        AecpPdu::aem_command(self.local_id(), controller, command_type, payload)
    }

    fn acquire(&mut self, controller: EntityId, flags: AcquireFlags) -> ResponderOutput {
        let payload = ownership(flags.0, DescriptorRef::entity());
        let command = self.aem(controller, AemCommandType::ACQUIRE_ENTITY, payload);
        self.send(&command)
    }

    fn lock(&mut self, controller: EntityId, flags: LockFlags) -> ResponderOutput {
        let payload = ownership(flags.0, DescriptorRef::entity());
        let command = self.aem(controller, AemCommandType::LOCK_ENTITY, payload);
        self.send(&command)
    }

    fn set_identify(&mut self, controller: EntityId, value: u8) -> ResponderOutput {
        let payload = ControlPayload {
            descriptor: DescriptorRef::new(DescriptorType::Control, 0),
            values: Bytes::copy_from_slice(&[value]),
        }
        .encode();
        let command = self.aem(controller, AemCommandType::SET_CONTROL, payload);
        self.send(&command)
    }

    fn set_format(
        &mut self,
        controller: EntityId,
        descriptor: DescriptorRef,
        stream_format: u64,
    ) -> ResponderOutput {
        let payload = StreamFormatPayload {
            descriptor,
            stream_format,
        }
        .encode();
        let command = self.aem(controller, AemCommandType::SET_STREAM_FORMAT, payload);
        self.send(&command)
    }

    fn set_name(
        &mut self,
        controller: EntityId,
        descriptor: DescriptorRef,
        name_index: u16,
        name: &str,
    ) -> ResponderOutput {
        let payload = NamePayload {
            descriptor,
            name_index,
            configuration_index: 0,
            name: name.to_string(),
        }
        .encode();
        let command = self.aem(controller, AemCommandType::SET_NAME, payload);
        self.send(&command)
    }

    fn get_name(&mut self, descriptor: DescriptorRef, name_index: u16) -> ResponderOutput {
        let payload = NamePayload {
            descriptor,
            name_index,
            configuration_index: 0,
            name: String::new(),
        }
        .encode()
        .slice(..NamePayload::COMMAND_SIZE);
        let command = self.aem(CONTROLLER_B, AemCommandType::GET_NAME, payload);
        self.send(&command)
    }

    fn register(&mut self, controller: EntityId) -> ResponderOutput {
        let command = self.aem(
            controller,
            AemCommandType::REGISTER_UNSOLICITED_NOTIFICATION,
            Bytes::new(),
        );
        self.send(&command)
    }

    fn streaming_command(
        &mut self,
        controller: EntityId,
        command_type: AemCommandType,
        descriptor: DescriptorRef,
    ) -> ResponderOutput {
        let command = self.aem(controller, command_type, descriptor.encode());
        self.send(&command)
    }
}

fn ownership(flags: u32, descriptor: DescriptorRef) -> Bytes {
    OwnershipPayload {
        flags,
        owner_id: EntityId::NONE,
        descriptor,
    }
    .encode()
}

fn owner(output: &ResponderOutput) -> EntityId {
    OwnershipPayload::decode(output.response.body.payload())
        .unwrap()
        .owner_id
}

#[test]
fn test_acquire_conflict_reports_owner() {
    let mut fx = Fixture::new(false);

    let first = fx.acquire(CONTROLLER_A, AcquireFlags::default());
    assert_eq!(first.response.status, AecpStatus::Success);
    assert_eq!(first.response.message_type, AecpMessageType::AemResponse);
    assert_eq!(owner(&first), CONTROLLER_A);
    assert!(matches!(
        first.events.as_slice(),
        [AvdeccEvent::OwnershipChanged {
            acquired_by: Some(CONTROLLER_A),
            locked_by: None
        }]
    ));

    let second = fx.acquire(CONTROLLER_B, AcquireFlags::default());
    assert_eq!(second.response.status, AecpStatus::EntityAcquired);
    assert_eq!(owner(&second), CONTROLLER_A);
    assert!(second.events.is_empty());
    assert_eq!(fx.responder.acquired_by(), Some(CONTROLLER_A));

    let again = fx.acquire(CONTROLLER_A, AcquireFlags::default());
    assert_eq!(again.response.status, AecpStatus::Success);
    assert!(again.events.is_empty());
}

#[test]
fn test_release_by_owner_only() {
    let mut fx = Fixture::new(false);
    fx.acquire(CONTROLLER_A, AcquireFlags::default());

    let refused = fx.acquire(CONTROLLER_B, AcquireFlags::RELEASE);
    assert_eq!(refused.response.status, AecpStatus::EntityAcquired);
    assert_eq!(fx.responder.acquired_by(), Some(CONTROLLER_A));

    let released = fx.acquire(CONTROLLER_A, AcquireFlags::RELEASE);
    assert_eq!(released.response.status, AecpStatus::Success);
    assert_eq!(owner(&released), EntityId::NONE);
    assert_eq!(fx.responder.acquired_by(), None);
    assert_eq!(released.events.len(), 1);

    let taken = fx.acquire(CONTROLLER_B, AcquireFlags::default());
    assert_eq!(taken.response.status, AecpStatus::Success);
}

#[test]
fn test_acquire_rejects_other_descriptors() {
    let mut fx = Fixture::new(false);
    let payload = ownership(0, DescriptorRef::new(DescriptorType::StreamOutput, 0));
    let command = fx.aem(CONTROLLER_A, AemCommandType::ACQUIRE_ENTITY, payload);

    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::BadArguments);
    assert_eq!(fx.responder.acquired_by(), None);

    let short = fx.aem(
        CONTROLLER_A,
        AemCommandType::ACQUIRE_ENTITY,
        Bytes::from_static(&[0, 0]),
    );
    assert_eq!(fx.send(&short).response.status, AecpStatus::BadArguments);
}

#[test]
fn test_milan_mode() {
    let mut fx = Fixture::new(true);

    let acquire = fx.acquire(CONTROLLER_A, AcquireFlags::default());
    assert_eq!(acquire.response.status, AecpStatus::NotImplemented);
    assert_eq!(fx.responder.acquired_by(), None);

    let command = AecpPdu::milan_command(
        fx.local_id(),
        CONTROLLER_A,
        MvuCommandType::GET_MILAN_INFO,
        Bytes::new(),
    );
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::Success);
    assert_eq!(
        output.response.message_type,
        AecpMessageType::VendorUniqueResponse
    );
    let info = MilanInfo::decode(output.response.body.payload()).unwrap();
    assert_eq!(info.protocol_version, 1);

    let mut fx = Fixture::new(false);
    assert_eq!(
        fx.send(&command).response.status,
        AecpStatus::NotImplemented
    );
}

#[test]
fn test_lock_and_expiry() {
    let mut fx = Fixture::new(false);

    let locked = fx.lock(CONTROLLER_A, LockFlags::default());
    assert_eq!(locked.response.status, AecpStatus::Success);
    assert_eq!(fx.responder.locked_by(), Some(CONTROLLER_A));
    assert_eq!(fx.responder.next_deadline(), Some(fx.now + LOCK_TIMEOUT));

    let refused = fx.lock(CONTROLLER_B, LockFlags::default());
    assert_eq!(refused.response.status, AecpStatus::EntityLocked);
    assert_eq!(owner(&refused), CONTROLLER_A);

    let blocked = fx.set_identify(CONTROLLER_B, 255);
    assert_eq!(blocked.response.status, AecpStatus::EntityLocked);

    assert!(fx.responder.poll(fx.now + Duration::from_secs(1)).is_none());
    let event = fx.responder.poll(fx.now + LOCK_TIMEOUT);
    assert!(matches!(
        event,
        Some(AvdeccEvent::OwnershipChanged { locked_by: None, .. })
    ));
    assert_eq!(fx.responder.locked_by(), None);

    fx.now += LOCK_TIMEOUT;
    let taken = fx.lock(CONTROLLER_B, LockFlags::default());
    assert_eq!(taken.response.status, AecpStatus::Success);
}

#[test]
fn test_expired_lock_released_by_next_command() {
    let mut fx = Fixture::new(false);
    fx.lock(CONTROLLER_A, LockFlags::default());

    fx.now += LOCK_TIMEOUT + Duration::from_secs(1);
    let output = fx.lock(CONTROLLER_B, LockFlags::default());
    assert_eq!(output.response.status, AecpStatus::Success);
    assert_eq!(fx.responder.locked_by(), Some(CONTROLLER_B));
    assert!(matches!(
        output.events.as_slice(),
        [AvdeccEvent::OwnershipChanged {
            locked_by: Some(CONTROLLER_B),
            ..
        }]
    ));
}

#[test]
fn test_unlock() {
    let mut fx = Fixture::new(false);
    fx.lock(CONTROLLER_A, LockFlags::default());

    let refused = fx.lock(CONTROLLER_B, LockFlags::UNLOCK);
    assert_eq!(refused.response.status, AecpStatus::EntityLocked);

    let unlocked = fx.lock(CONTROLLER_A, LockFlags::UNLOCK);
    assert_eq!(unlocked.response.status, AecpStatus::Success);
    assert_eq!(fx.responder.locked_by(), None);
    assert_eq!(fx.responder.next_deadline(), None);

    let payload = ownership(0, DescriptorRef::new(DescriptorType::Control, 0));
    let command = fx.aem(CONTROLLER_A, AemCommandType::LOCK_ENTITY, payload);
    assert_eq!(fx.send(&command).response.status, AecpStatus::NotSupported);
}

#[test]
fn test_acquire_and_lock_independent() {
    let mut fx = Fixture::new(false);
    fx.acquire(CONTROLLER_A, AcquireFlags::default());

    let locked = fx.lock(CONTROLLER_B, LockFlags::default());
    assert_eq!(locked.response.status, AecpStatus::Success);
    assert_eq!(fx.responder.acquired_by(), Some(CONTROLLER_A));
    assert_eq!(fx.responder.locked_by(), Some(CONTROLLER_B));

    // Each holder is blocked by the other
    assert_eq!(
        fx.set_identify(CONTROLLER_A, 255).response.status,
        AecpStatus::EntityLocked
    );
    assert_eq!(
        fx.set_identify(CONTROLLER_B, 255).response.status,
        AecpStatus::EntityAcquired
    );
}

#[test]
fn test_set_control() {
    let mut fx = Fixture::new(false);

    let output = fx.set_identify(CONTROLLER_A, 255);
    assert_eq!(output.response.status, AecpStatus::Success);
    let values = ControlPayload::decode(output.response.body.payload()).unwrap();
    assert_eq!(values.values.as_ref(), &[255]);
    assert!(matches!(
        output.events.as_slice(),
        [AvdeccEvent::ControlChanged { control_index: 0, .. }]
    ));

    let same = fx.set_identify(CONTROLLER_A, 255);
    assert_eq!(same.response.status, AecpStatus::Success);
    assert!(same.events.is_empty());

    let off_step = fx.set_identify(CONTROLLER_A, 3);
    assert_eq!(off_step.response.status, AecpStatus::BadArguments);
    let values = ControlPayload::decode(off_step.response.body.payload()).unwrap();
    assert_eq!(values.values.as_ref(), &[255]);

    let get = fx.aem(
        CONTROLLER_B,
        AemCommandType::GET_CONTROL,
        DescriptorRef::new(DescriptorType::Control, 0).encode(),
    );
    let output = fx.send(&get);
    assert_eq!(output.response.status, AecpStatus::Success);
    assert_eq!(
        ControlPayload::decode(output.response.body.payload())
            .unwrap()
            .values
            .as_ref(),
        &[255]
    );

    let missing = fx.aem(
        CONTROLLER_B,
        AemCommandType::GET_CONTROL,
        DescriptorRef::new(DescriptorType::Control, 9).encode(),
    );
    assert_eq!(
        fx.send(&missing).response.status,
        AecpStatus::NoSuchDescriptor
    );
}

#[test]
fn test_read_descriptor() {
    let mut fx = Fixture::new(false);
    let read = |configuration_index, descriptor| {
        ReadDescriptorCommand {
            configuration_index,
            descriptor,
        }
        .encode()
    };

    let command = fx.aem(
        CONTROLLER_A,
        AemCommandType::READ_DESCRIPTOR,
        read(0, DescriptorRef::new(DescriptorType::StreamOutput, 0)),
    );
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::Success);
    let response = ReadDescriptorResponse::decode(output.response.body.payload()).unwrap();
    let DescriptorBody::StreamOutput(stream) = response.descriptor.body else {
        panic!("expected a STREAM_OUTPUT descriptor");
    };
    assert_eq!(stream.object_name, "Main out");

    let missing = read(0, DescriptorRef::new(DescriptorType::StreamInput, 0));
    let command = fx.aem(CONTROLLER_A, AemCommandType::READ_DESCRIPTOR, missing.clone());
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::NoSuchDescriptor);
    assert_eq!(output.response.body.payload(), &missing);

    let other_configuration = fx.aem(
        CONTROLLER_A,
        AemCommandType::READ_DESCRIPTOR,
        read(1, DescriptorRef::new(DescriptorType::StreamOutput, 0)),
    );
    assert_eq!(
        fx.send(&other_configuration).response.status,
        AecpStatus::NoSuchDescriptor
    );

    let entity_any_configuration = fx.aem(
        CONTROLLER_A,
        AemCommandType::READ_DESCRIPTOR,
        read(3, DescriptorRef::entity()),
    );
    assert_eq!(
        fx.send(&entity_any_configuration).response.status,
        AecpStatus::Success
    );
}

#[test]
fn test_start_stop_streaming() {
    let mut fx = Fixture::new(false);
    let output_0 = DescriptorRef::new(DescriptorType::StreamOutput, 0);

    let started = fx.streaming_command(CONTROLLER_A, AemCommandType::START_STREAMING, output_0);
    assert_eq!(started.response.status, AecpStatus::Success);
    assert!(fx.entity.is_running(StreamHandle::output(0)));
    assert!(matches!(
        started.events.as_slice(),
        [AvdeccEvent::StreamingChanged { running: true, .. }]
    ));
    let log = fx.streaming.log();
    assert_eq!(log.started.len(), 1);
    assert_eq!(log.started[0].stream_id, fx.entity.stream_id(0));

    let stopped = fx.streaming_command(CONTROLLER_A, AemCommandType::STOP_STREAMING, output_0);
    assert_eq!(stopped.response.status, AecpStatus::Success);
    assert!(!fx.entity.is_running(StreamHandle::output(0)));
    assert_eq!(fx.streaming.log().stopped, vec![StreamHandle::output(0)]);

    let unknown = fx.streaming_command(
        CONTROLLER_A,
        AemCommandType::START_STREAMING,
        DescriptorRef::new(DescriptorType::StreamInput, 0),
    );
    assert_eq!(unknown.response.status, AecpStatus::NoSuchDescriptor);
}

#[test]
fn test_streaming_backend_refusal() {
    let mut fx = Fixture::new(false);
    fx.streaming.set_faults(StreamingFaults {
        start: Some(AecpStatus::StreamIsRunning),
        ..StreamingFaults::default()
    });

    let output = fx.streaming_command(
        CONTROLLER_A,
        AemCommandType::START_STREAMING,
        DescriptorRef::new(DescriptorType::StreamOutput, 1),
    );
    assert_eq!(output.response.status, AecpStatus::StreamIsRunning);
    assert!(output.events.is_empty());
    assert!(!fx.entity.is_running(StreamHandle::output(1)));
}

#[test]
fn test_streaming_requires_access() {
    let mut fx = Fixture::new(false);
    fx.acquire(CONTROLLER_A, AcquireFlags::default());

    let output = fx.streaming_command(
        CONTROLLER_B,
        AemCommandType::START_STREAMING,
        DescriptorRef::new(DescriptorType::StreamOutput, 0),
    );
    assert_eq!(output.response.status, AecpStatus::EntityAcquired);
    assert!(fx.streaming.log().started.is_empty());
}

#[test]
fn test_unsolicited_notifications() {
    let mut fx = Fixture::new(false);
    assert_eq!(fx.register(CONTROLLER_B).response.status, AecpStatus::Success);
    assert_eq!(fx.register(CONTROLLER_C).response.status, AecpStatus::Success);
    assert_eq!(
        fx.responder.registered_controllers(),
        vec![CONTROLLER_B, CONTROLLER_C]
    );

    let output = fx.set_identify(CONTROLLER_B, 255);
    let [(mac, notification)] = output.notifications.as_slice() else {
        panic!("expected one notification, got {:?}", output.notifications);
    };
    assert_eq!(*mac, test_mac(0x0C));
    assert!(notification.is_unsolicited());
    assert_eq!(notification.controller_entity_id, CONTROLLER_C);
    assert_eq!(notification.target_entity_id, fx.local_id());
    assert_eq!(notification.sequence_id, 0);
    assert_eq!(
        notification.aem_command_type(),
        Some(AemCommandType::SET_CONTROL)
    );

    let output = fx.set_identify(CONTROLLER_A, 0);
    assert_eq!(output.notifications.len(), 2);
    let to_c = output
        .notifications
        .iter()
        .find(|(_, n)| n.controller_entity_id == CONTROLLER_C)
        .unwrap();
    assert_eq!(to_c.1.sequence_id, 1);

    let refused = fx.set_identify(CONTROLLER_A, 7);
    assert!(refused.notifications.is_empty());

    let deregister = fx.aem(
        CONTROLLER_C,
        AemCommandType::DEREGISTER_UNSOLICITED_NOTIFICATION,
        Bytes::new(),
    );
    fx.send(&deregister);
    assert_eq!(fx.responder.registered_controllers(), vec![CONTROLLER_B]);
}

#[test]
fn test_registration_limit() {
    let mut fx = Fixture::new(false);
    for n in 0..crate::engine::aecp::MAX_REGISTRATIONS {
        let controller = EntityId(0x100 + u64::try_from(n).unwrap());
        assert_eq!(fx.register(controller).response.status, AecpStatus::Success);
    }
    let full = fx.register(EntityId(0x999));
    assert_eq!(full.response.status, AecpStatus::NoResources);

    // Re-registering an existing controller still succeeds
    assert_eq!(
        fx.register(EntityId(0x100)).response.status,
        AecpStatus::Success
    );
}

#[test]
fn test_get_counters() {
    let mut fx = Fixture::new(false);
    fx.counters.frames_rx = 42;

    let command = fx.aem(
        CONTROLLER_A,
        AemCommandType::GET_COUNTERS,
        DescriptorRef::new(DescriptorType::AvbInterface, 0).encode(),
    );
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::Success);
    let counters = CountersResponse::decode(output.response.body.payload()).unwrap();
    assert_eq!(counters.counters[avb_interface_counters::FRAMES_RX], 42);

    fx.streaming_command(
        CONTROLLER_A,
        AemCommandType::START_STREAMING,
        DescriptorRef::new(DescriptorType::StreamOutput, 0),
    );
    let command = fx.aem(
        CONTROLLER_A,
        AemCommandType::GET_COUNTERS,
        DescriptorRef::new(DescriptorType::StreamOutput, 0).encode(),
    );
    let counters = CountersResponse::decode(fx.send(&command).response.body.payload()).unwrap();
    assert_eq!(counters.counters[0], 1);

    let command = fx.aem(
        CONTROLLER_A,
        AemCommandType::GET_COUNTERS,
        DescriptorRef::new(DescriptorType::Control, 0).encode(),
    );
    assert_eq!(
        fx.send(&command).response.status,
        AecpStatus::NoSuchDescriptor
    );
}

#[test]
fn test_stream_format() {
    const ALTERNATE: u64 = 0x0205_0222_0080_6000;
    let mut config = talker_config(1);
    config.entity.talker_streams[0].alternate_formats = vec![ALTERNATE];
    let mut fx = Fixture::with_config(&config, false);
    let output_0 = DescriptorRef::new(DescriptorType::StreamOutput, 0);
    let configured = config.entity.talker_streams[0].format;
    fx.register(CONTROLLER_B);

    let get = fx.aem(CONTROLLER_B, AemCommandType::GET_STREAM_FORMAT, output_0.encode());
    let output = fx.send(&get);
    assert_eq!(output.response.status, AecpStatus::Success);
    let current = StreamFormatPayload::decode(output.response.body.payload()).unwrap();
    assert_eq!(current.stream_format, configured);

    let refused = fx.set_format(CONTROLLER_A, output_0, 0x1234);
    assert_eq!(refused.response.status, AecpStatus::NotSupported);
    let payload = StreamFormatPayload::decode(refused.response.body.payload()).unwrap();
    assert_eq!(payload.stream_format, configured);
    assert!(refused.notifications.is_empty());

    let changed = fx.set_format(CONTROLLER_A, output_0, ALTERNATE);
    assert_eq!(changed.response.status, AecpStatus::Success);
    assert_eq!(fx.entity.stream_format(StreamHandle::output(0)), Some(ALTERNATE));
    assert!(matches!(
        changed.events.as_slice(),
        [AvdeccEvent::StreamFormatChanged { format: ALTERNATE, .. }]
    ));
    assert_eq!(changed.notifications.len(), 1);

    // Same format again: success without a notification
    let again = fx.set_format(CONTROLLER_A, output_0, ALTERNATE);
    assert_eq!(again.response.status, AecpStatus::Success);
    assert!(again.events.is_empty());
    assert!(again.notifications.is_empty());

    let read = fx.aem(
        CONTROLLER_B,
        AemCommandType::READ_DESCRIPTOR,
        ReadDescriptorCommand {
            configuration_index: 0,
            descriptor: output_0,
        }
        .encode(),
    );
    let read = ReadDescriptorResponse::decode(fx.send(&read).response.body.payload()).unwrap();
    let DescriptorBody::StreamOutput(stream) = read.descriptor.body else {
        panic!("expected a STREAM_OUTPUT descriptor");
    };
    assert_eq!(stream.current_format, ALTERNATE);
    assert_eq!(stream.formats, vec![configured, ALTERNATE]);

    fx.streaming_command(CONTROLLER_A, AemCommandType::START_STREAMING, output_0);
    let running = fx.set_format(CONTROLLER_A, output_0, configured);
    assert_eq!(running.response.status, AecpStatus::StreamIsRunning);
    fx.streaming_command(CONTROLLER_A, AemCommandType::STOP_STREAMING, output_0);

    fx.acquire(CONTROLLER_A, AcquireFlags::default());
    let acquired = fx.set_format(CONTROLLER_B, output_0, configured);
    assert_eq!(acquired.response.status, AecpStatus::EntityAcquired);
    let payload = StreamFormatPayload::decode(acquired.response.body.payload()).unwrap();
    assert_eq!(payload.stream_format, ALTERNATE);

    let control = fx.aem(
        CONTROLLER_B,
        AemCommandType::GET_STREAM_FORMAT,
        DescriptorRef::new(DescriptorType::Control, 0).encode(),
    );
    assert_eq!(fx.send(&control).response.status, AecpStatus::BadArguments);
    let missing = fx.aem(
        CONTROLLER_B,
        AemCommandType::GET_STREAM_FORMAT,
        DescriptorRef::new(DescriptorType::StreamOutput, 5).encode(),
    );
    assert_eq!(fx.send(&missing).response.status, AecpStatus::NoSuchDescriptor);
}

#[test]
fn test_get_stream_info() {
    let mut fx = Fixture::new(false);
    let output_1 = DescriptorRef::new(DescriptorType::StreamOutput, 1);

    let command = fx.aem(CONTROLLER_A, AemCommandType::GET_STREAM_INFO, output_1.encode());
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::Success);
    let info = StreamInfo::decode(output.response.body.payload()).unwrap();
    assert_eq!(info.descriptor, output_1);
    assert!(info.flags.contains(
        StreamInfoFlags::STREAM_FORMAT_VALID
            | StreamInfoFlags::STREAM_ID_VALID
            | StreamInfoFlags::STREAM_DEST_MAC_VALID
            | StreamInfoFlags::STREAM_VLAN_ID_VALID
    ));
    assert!(!info.flags.contains(StreamInfoFlags::CONNECTED));
    assert_eq!(info.stream_id, fx.entity.stream_id(1));
    assert_eq!(info.stream_dest_mac, fx.entity.stream_dest_mac(1));
    assert_eq!(info.stream_vlan_id, 2);
    assert_eq!(
        Some(info.stream_format),
        fx.entity.stream_format(StreamHandle::output(1))
    );

    let interface = fx.aem(
        CONTROLLER_A,
        AemCommandType::GET_STREAM_INFO,
        DescriptorRef::new(DescriptorType::AvbInterface, 0).encode(),
    );
    assert_eq!(fx.send(&interface).response.status, AecpStatus::BadArguments);
    let missing = fx.aem(
        CONTROLLER_A,
        AemCommandType::GET_STREAM_INFO,
        DescriptorRef::new(DescriptorType::StreamInput, 0).encode(),
    );
    assert_eq!(fx.send(&missing).response.status, AecpStatus::NoSuchDescriptor);

    // An unconnected listener knows only its format
    let mut fx = Fixture::with_config(&listener_config(2), false);
    let input_0 = DescriptorRef::new(DescriptorType::StreamInput, 0);
    let command = fx.aem(CONTROLLER_A, AemCommandType::GET_STREAM_INFO, input_0.encode());
    let info = StreamInfo::decode(fx.send(&command).response.body.payload()).unwrap();
    assert_eq!(info.flags, StreamInfoFlags::STREAM_FORMAT_VALID);
    assert_eq!(info.stream_dest_mac, MacAddress::ZERO);
}

#[test]
fn test_get_avb_info() {
    let interface = DescriptorRef::new(DescriptorType::AvbInterface, 0);
    for milan_mode in [false, true] {
        let mut fx = Fixture::new(milan_mode);
        let command = fx.aem(CONTROLLER_A, AemCommandType::GET_AVB_INFO, interface.encode());
        let output = fx.send(&command);
        assert_eq!(output.response.status, AecpStatus::Success);
        let info = AvbInfo::decode(output.response.body.payload()).unwrap();
        assert_eq!(info.descriptor, interface);
        assert_eq!(info.gptp_grandmaster_id, GptpInfo::default().grandmaster_id);
        assert_eq!(
            info.flags,
            avb_info_flags::AS_CAPABLE | avb_info_flags::GPTP_ENABLED | avb_info_flags::SRP_ENABLED
        );
        assert_eq!(info.msrp_mappings.len(), usize::from(milan_mode));
    }

    let mut fx = Fixture::new(false);
    let stream = fx.aem(
        CONTROLLER_A,
        AemCommandType::GET_AVB_INFO,
        DescriptorRef::new(DescriptorType::StreamOutput, 0).encode(),
    );
    assert_eq!(fx.send(&stream).response.status, AecpStatus::BadArguments);
    let second = fx.aem(
        CONTROLLER_A,
        AemCommandType::GET_AVB_INFO,
        DescriptorRef::new(DescriptorType::AvbInterface, 1).encode(),
    );
    assert_eq!(fx.send(&second).response.status, AecpStatus::NoSuchDescriptor);
}

#[test]
fn test_names() {
    let mut fx = Fixture::new(false);
    let name = |output: &ResponderOutput| {
        NamePayload::decode(output.response.body.payload())
            .unwrap()
            .name
    };
    fx.register(CONTROLLER_B);

    let entity_name = fx.get_name(DescriptorRef::entity(), 0);
    assert_eq!(entity_name.response.status, AecpStatus::Success);
    assert_eq!(name(&entity_name), "Talker");
    assert_eq!(
        fx.get_name(DescriptorRef::entity(), 2).response.status,
        AecpStatus::BadArguments
    );

    let output_1 = DescriptorRef::new(DescriptorType::StreamOutput, 1);
    assert_eq!(name(&fx.get_name(output_1, 0)), "Aux out");
    let renamed = fx.set_name(CONTROLLER_A, output_1, 0, "Monitor");
    assert_eq!(renamed.response.status, AecpStatus::Success);
    assert_eq!(name(&renamed), "Monitor");
    assert!(matches!(
        renamed.events.as_slice(),
        [AvdeccEvent::NameChanged { name_index: 0, name, .. }] if name == "Monitor"
    ));
    assert_eq!(renamed.notifications.len(), 1);
    assert_eq!(name(&fx.get_name(output_1, 0)), "Monitor");

    let group = fx.set_name(CONTROLLER_A, DescriptorRef::entity(), 1, "Stage left");
    assert_eq!(group.response.status, AecpStatus::Success);
    let read = fx.aem(
        CONTROLLER_B,
        AemCommandType::READ_DESCRIPTOR,
        ReadDescriptorCommand {
            configuration_index: 0,
            descriptor: DescriptorRef::entity(),
        }
        .encode(),
    );
    let read = ReadDescriptorResponse::decode(fx.send(&read).response.body.payload()).unwrap();
    let DescriptorBody::Entity(entity) = read.descriptor.body else {
        panic!("expected an ENTITY descriptor");
    };
    assert_eq!(entity.group_name, "Stage left");

    let clock = DescriptorRef::new(DescriptorType::ClockDomain, 0);
    assert_eq!(
        fx.set_name(CONTROLLER_A, clock, 0, "Word clock").response.status,
        AecpStatus::Success
    );
    assert_eq!(name(&fx.get_name(clock, 0)), "Word clock");

    fx.lock(CONTROLLER_A, LockFlags::default());
    let locked = fx.set_name(CONTROLLER_B, output_1, 0, "Other");
    assert_eq!(locked.response.status, AecpStatus::EntityLocked);
    assert_eq!(name(&locked), "Monitor");

    let audio_unit = DescriptorRef::new(DescriptorType::AudioUnit, 0);
    assert_eq!(
        fx.get_name(audio_unit, 0).response.status,
        AecpStatus::BadArguments
    );
    let missing = DescriptorRef::new(DescriptorType::Control, 9);
    assert_eq!(
        fx.get_name(missing, 0).response.status,
        AecpStatus::NoSuchDescriptor
    );

    let other_configuration = NamePayload {
        descriptor: output_1,
        name_index: 0,
        configuration_index: 1,
        name: String::new(),
    }
    .encode();
    let command = fx.aem(CONTROLLER_B, AemCommandType::GET_NAME, other_configuration);
    assert_eq!(fx.send(&command).response.status, AecpStatus::NotSupported);

    let without_name = fx
        .get_name(output_1, 0)
        .response
        .body
        .payload()
        .slice(..NamePayload::COMMAND_SIZE);
    let no_name = fx.aem(CONTROLLER_A, AemCommandType::SET_NAME, without_name);
    assert_eq!(fx.send(&no_name).response.status, AecpStatus::BadArguments);
}

#[test]
fn test_set_configuration() {
    let mut fx = Fixture::new(false);
    let set = |index: u16| {
        let mut payload = vec![0, 0];
        payload.extend_from_slice(&index.to_be_bytes());
        Bytes::from(payload)
    };

    let command = fx.aem(CONTROLLER_A, AemCommandType::SET_CONFIGURATION, set(0));
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::Success);
    assert_eq!(output.response.body.payload().as_ref(), &[0, 0, 0, 0]);

    let command = fx.aem(CONTROLLER_A, AemCommandType::SET_CONFIGURATION, set(1));
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::NotSupported);
    assert_eq!(output.response.body.payload().as_ref(), &[0, 0, 0, 0]);

    fx.streaming_command(
        CONTROLLER_A,
        AemCommandType::START_STREAMING,
        DescriptorRef::new(DescriptorType::StreamOutput, 0),
    );
    let command = fx.aem(CONTROLLER_A, AemCommandType::SET_CONFIGURATION, set(0));
    assert_eq!(fx.send(&command).response.status, AecpStatus::StreamIsRunning);
}

#[test]
fn test_unsupported_commands() {
    let mut fx = Fixture::new(false);

    let payload = Bytes::from_static(b"\x00\x01\x02");
    let command = fx.aem(CONTROLLER_A, AemCommandType::GET_AS_PATH, payload.clone());
    let output = fx.send(&command);
    assert_eq!(output.response.status, AecpStatus::NotImplemented);
    assert_eq!(output.response.body.payload(), &payload);

    let vendor = AecpPdu::vendor_unique_command(
        fx.local_id(),
        CONTROLLER_A,
        0x0012_3456_7890,
        payload.clone(),
    );
    let output = fx.send(&vendor);
    assert_eq!(output.response.status, AecpStatus::NotImplemented);
    assert_eq!(output.response.body.payload(), &payload);

    let address_access = AecpPdu {
        message_type: AecpMessageType::AddressAccessCommand,
        body: AecpBody::Other {
            payload: payload.clone(),
        },
        ..fx.aem(CONTROLLER_A, AemCommandType::ACQUIRE_ENTITY, Bytes::new())
    };
    let output = fx.send(&address_access);
    assert_eq!(output.response.status, AecpStatus::NotImplemented);
    assert_eq!(
        output.response.message_type,
        AecpMessageType::AddressAccessResponse
    );

    let available = fx.aem(CONTROLLER_A, AemCommandType::ENTITY_AVAILABLE, Bytes::new());
    assert_eq!(fx.send(&available).response.status, AecpStatus::Success);
}

#[test]
fn test_controller_departure_releases_entity() {
    let mut fx = Fixture::new(false);
    fx.acquire(CONTROLLER_A, AcquireFlags::default());
    fx.lock(CONTROLLER_A, LockFlags::default());
    fx.register(CONTROLLER_A);

    let event = fx.responder.entity_departed(CONTROLLER_A);
    assert!(matches!(
        event,
        Some(AvdeccEvent::OwnershipChanged {
            acquired_by: None,
            locked_by: None
        })
    ));
    assert!(fx.responder.registered_controllers().is_empty());
    assert!(fx.responder.entity_departed(CONTROLLER_A).is_none());
}

#[test]
fn test_persistent_acquisition_survives_departure() {
    let mut fx = Fixture::new(false);
    fx.acquire(CONTROLLER_A, AcquireFlags::PERSISTENT);

    assert!(fx.responder.entity_departed(CONTROLLER_A).is_none());
    assert_eq!(fx.responder.acquired_by(), Some(CONTROLLER_A));
}

// Controller side

const TARGET: EntityId = EntityId(0x2000);
const TARGET_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0x20, 0]);

type Receiver = oneshot::Receiver<Result<AecpPdu>>;

fn controller(capacity: usize) -> AecpController {
    AecpController::new(CONTROLLER_A, AECP_TIMEOUT, 2, capacity)
}

fn read_entity() -> AecpPdu {
    let payload = ReadDescriptorCommand {
        configuration_index: 0,
        descriptor: DescriptorRef::entity(),
    }
    .encode();
    AecpPdu::aem_command(
        TARGET,
        EntityId::NONE,
        AemCommandType::READ_DESCRIPTOR,
        payload,
    )
}

fn begin(controller: &mut AecpController, now: Instant) -> (AecpPdu, Receiver) {
    let (tx, rx) = oneshot::channel();
    let (_, sent) = controller
        .begin(read_entity(), TARGET_MAC, tx, now)
        .expect("tracker has room");
    (sent, rx)
}

#[test]
fn test_command_completes() {
    let mut controller = controller(4);
    let now = Instant::now();
    let (sent, mut rx) = begin(&mut controller, now);

    assert_eq!(sent.controller_entity_id, CONTROLLER_A);
    assert_eq!(controller.len(), 1);
    assert_eq!(controller.next_deadline(), Some(now + AECP_TIMEOUT));

    let response = sent.to_response(AecpStatus::Success, Bytes::from_static(b"ok"));
    let event = controller.handle_response(&response, now);
    assert!(matches!(event, ControllerEvent::Completed { .. }));
    assert_eq!(rx.try_recv().unwrap().unwrap(), response);
    assert!(controller.is_empty());

    let duplicate = controller.handle_response(&response, now);
    assert!(matches!(duplicate, ControllerEvent::Ignored));
}

#[test]
fn test_error_status_fails_request() {
    let mut controller = controller(4);
    let now = Instant::now();
    let (sent, mut rx) = begin(&mut controller, now);

    let response = sent.to_response(AecpStatus::NoSuchDescriptor, Bytes::new());
    controller.handle_response(&response, now);
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(AvdeccError::AecpStatus(AecpStatus::NoSuchDescriptor))
    ));
}

#[test]
fn test_in_progress_extends_deadline() {
    let mut controller = controller(4);
    let now = Instant::now();
    let (sent, mut rx) = begin(&mut controller, now);

    let later = now + Duration::from_millis(200);
    let in_progress = sent.to_response(AecpStatus::InProgress, Bytes::new());
    assert!(matches!(
        controller.handle_response(&in_progress, later),
        ControllerEvent::InProgress
    ));
    assert_eq!(controller.next_deadline(), Some(later + AECP_TIMEOUT));
    assert!(rx.try_recv().is_err());

    assert!(controller.poll(now + AECP_TIMEOUT).is_empty());
    controller.handle_response(&sent.to_response(AecpStatus::Success, Bytes::new()), later);
    assert!(rx.try_recv().unwrap().is_ok());
}

#[test]
fn test_retries_then_timeout() {
    let mut controller = controller(4);
    let now = Instant::now();
    let (sent, mut rx) = begin(&mut controller, now);

    let first_retry = controller.poll(now + AECP_TIMEOUT);
    let [(mac, resent)] = first_retry.as_slice() else {
        panic!("expected one retry");
    };
    assert_eq!(*mac, TARGET_MAC);
    assert_ne!(resent.sequence_id, sent.sequence_id);

    // The answer to the first attempt is stale now
    let stale = sent.to_response(AecpStatus::Success, Bytes::new());
    assert!(matches!(
        controller.handle_response(&stale, now + AECP_TIMEOUT),
        ControllerEvent::Ignored
    ));

    assert_eq!(controller.poll(now + AECP_TIMEOUT * 2).len(), 1);
    assert!(controller.poll(now + AECP_TIMEOUT * 3).is_empty());
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(AvdeccError::Timeout { target }) if target == TARGET
    ));
    assert!(controller.is_empty());
}

#[test]
fn test_full_tracker_rejects_synchronously() {
    let mut controller = controller(1);
    let now = Instant::now();
    let (_sent, _rx) = begin(&mut controller, now);

    let (tx, mut rx) = oneshot::channel();
    assert!(controller.begin(read_entity(), TARGET_MAC, tx, now).is_none());
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(AvdeccError::NoResources { capacity: 1 })
    ));
}

#[test]
fn test_oversized_command_rejected_synchronously() {
    let mut controller = controller(4);
    let command = AecpPdu::aem_command(
        TARGET,
        EntityId::NONE,
        AemCommandType::SET_CONTROL,
        Bytes::from(vec![0u8; AecpPdu::MAX_AEM_PAYLOAD + 1]),
    );
    assert!(!command.fits());

    let (tx, mut rx) = oneshot::channel();
    assert!(controller.begin(command, TARGET_MAC, tx, Instant::now()).is_none());
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(AvdeccError::InvalidParameter { .. })
    ));
    assert!(controller.is_empty());
}

#[test]
fn test_unsolicited_and_foreign_responses() {
    let mut controller = controller(4);
    let now = Instant::now();

    let notification = AecpPdu {
        message_type: AecpMessageType::AemResponse,
        status: AecpStatus::Success,
        target_entity_id: TARGET,
        controller_entity_id: CONTROLLER_A,
        sequence_id: 7,
        body: AecpBody::Aem {
            unsolicited: true,
            command_type: AemCommandType::SET_CONTROL,
            payload: Bytes::from_static(&[0, 0x1A, 0, 0, 255]),
        },
    };
    assert!(matches!(
        controller.handle_response(&notification, now),
        ControllerEvent::Unsolicited(AvdeccEvent::UnsolicitedResponse {
            entity_id: TARGET,
            command_type: AemCommandType::SET_CONTROL,
            ..
        })
    ));

    let foreign = AecpPdu {
        controller_entity_id: CONTROLLER_B,
        ..notification
    };
    assert!(matches!(
        controller.handle_response(&foreign, now),
        ControllerEvent::Ignored
    ));
}

#[test]
fn test_mismatched_command_type_ignored() {
    let mut controller = controller(4);
    let now = Instant::now();
    let (sent, mut rx) = begin(&mut controller, now);

    let wrong = AecpPdu {
        body: AecpBody::Aem {
            unsolicited: false,
            command_type: AemCommandType::GET_CONTROL,
            payload: Bytes::new(),
        },
        ..sent.to_response(AecpStatus::Success, Bytes::new())
    };
    assert!(matches!(
        controller.handle_response(&wrong, now),
        ControllerEvent::Ignored
    ));
    assert!(rx.try_recv().is_err());
    assert_eq!(controller.len(), 1);
}

#[test]
fn test_departure_and_cancel() {
    let mut controller = controller(4);
    let now = Instant::now();
    let (_sent, mut departed_rx) = begin(&mut controller, now);

    controller.entity_departed(TARGET);
    assert!(matches!(
        departed_rx.try_recv().unwrap(),
        Err(AvdeccError::EntityNotFound { entity_id }) if entity_id == TARGET
    ));

    let (_sent, mut cancelled_rx) = begin(&mut controller, now);
    controller.cancel_all();
    assert!(matches!(
        cancelled_rx.try_recv().unwrap(),
        Err(AvdeccError::Cancelled)
    ));
    assert!(controller.is_empty());
}
