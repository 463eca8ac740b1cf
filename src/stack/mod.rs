//! The control channel of one logical port.
//!
//! [`AvdeccStack`] is the single dispatch point: inbound frames, application
//! requests and timer ticks all go through it, so the engines, the tracker
//! and the directory need no locking. It is synchronous and driven by an
//! explicit `now`; [`AvdeccStack::spawn`] runs it as a tokio task and hands
//! back an [`AvdeccHandle`].

mod handle;
mod request;
mod runner;


use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

pub use handle::AvdeccHandle;
pub(crate) use request::Request;
use runner::Runner;

use crate::directory::EntityDirectory;
use crate::engine::{
    AcmpEngine, AcmpOutput, AdpEngine, AdpOutcome, AecpController, AecpResponder,
    ControllerEvent, InterfaceCounters, LocalEntity, Reply, ResponderContext, send_reply,
};
use crate::error::Result;
use crate::net::{Frame, GptpSource, StreamingBackend, Transport};
use crate::protocol::aecp::{AecpPdu, AemCommandType};
use crate::protocol::aem::ReadDescriptorResponse;
use crate::protocol::{AVTP_ETHERTYPE, AcmpMessageType, AcmpPdu, AdpPdu, ControlPdu};
use crate::state::{AvdeccEvent, DepartureReason, EventBus};
use crate::types::{AvdeccConfig, EntityId, MacAddress};

/// PDUs the stack may hand to itself while serving one input
const LOOPBACK_LIMIT: usize = 64;

/// AVDECC control channel: local entity, engines and directory
pub struct AvdeccStack {
    config: AvdeccConfig,
    transport: Box<dyn Transport>,
    streaming: Box<dyn StreamingBackend>,
    gptp: Box<dyn GptpSource>,
    entity: LocalEntity,
    directory: EntityDirectory,
    adp: AdpEngine,
    responder: AecpResponder,
    controller: AecpController,
    acmp: AcmpEngine,
    counters: InterfaceCounters,
    events: EventBus,
    loopback: VecDeque<ControlPdu>,
}

impl std::fmt::Debug for AvdeccStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvdeccStack")
            .field("entity_id", &self.entity.entity_id())
            .field("port", &self.config.port)
            .field("entities", &self.directory.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl AvdeccStack {
    /// Build a stack from a configuration and its collaborators.
    ///
    /// A zero `mac_address` is taken from the transport before the
    /// configuration is validated.
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::Config` if the configuration is invalid.
    pub fn new(
        mut config: AvdeccConfig,
        transport: impl Transport + 'static,
        streaming: impl StreamingBackend + 'static,
        gptp: impl GptpSource + 'static,
    ) -> Result<Self> {
        if config.mac_address == MacAddress::ZERO {
            config.mac_address = transport.local_mac(config.port);
        }
        config.validate()?;

        let entity = LocalEntity::new(&config);
        let local_id = entity.entity_id();
        let adp = AdpEngine::new(local_id, config.valid_time, config.advertise_interval());
        let responder = AecpResponder::new(local_id, config.lock_timeout, config.milan_mode);
        let controller = AecpController::new(
            local_id,
            config.aecp_timeout,
            config.aecp_retries,
            config.max_inflight,
        );
        let acmp = AcmpEngine::new(
            local_id,
            config.acmp_retries,
            config.max_inflight,
            entity.is_controller(),
        );
        info!(entity_id = %local_id, mac = %config.mac_address, port = config.port, "AVDECC stack created");

        Ok(Self {
            directory: EntityDirectory::new(config.max_entities),
            transport: Box::new(transport),
            streaming: Box::new(streaming),
            gptp: Box::new(gptp),
            entity,
            adp,
            responder,
            controller,
            acmp,
            counters: InterfaceCounters::default(),
            events: EventBus::new(),
            loopback: VecDeque::new(),
            config,
        })
    }

    /// Id of the local entity
    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.entity.entity_id()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &AvdeccConfig {
        &self.config
    }

    /// Known remote entities
    #[must_use]
    pub fn directory(&self) -> &EntityDirectory {
        &self.directory
    }

    /// Local entity model
    #[must_use]
    pub fn local_entity(&self) -> &LocalEntity {
        &self.entity
    }

    /// ACMP state of the local entity
    #[must_use]
    pub fn acmp(&self) -> &AcmpEngine {
        &self.acmp
    }

    /// Acquire, lock and notification state of the local entity
    #[must_use]
    pub fn responder(&self) -> &AecpResponder {
        &self.responder
    }

    /// AVB_INTERFACE counters
    #[must_use]
    pub fn counters(&self) -> InterfaceCounters {
        self.counters
    }

    /// Event bus of this stack
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AvdeccEvent> {
        self.events.subscribe()
    }

    /// Bring the link up and start advertising
    pub fn start(&mut self, now: Instant) {
        if self.adp.is_running() {
            return;
        }
        self.counters.link_up = self.counters.link_up.wrapping_add(1);
        self.adp.start(now);
        info!(entity_id = %self.entity_id(), "advertising started");
        self.poll(now);
    }

    /// Whether the local entity is advertised
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.adp.is_running()
    }

    /// Earliest instant [`poll`](Self::poll) has work to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.adp.next_deadline(),
            self.directory.next_expiry(),
            self.controller.next_deadline(),
            self.acmp.next_deadline(),
            self.responder.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Process one inbound Ethernet frame
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) {
        if frame.ethertype != AVTP_ETHERTYPE {
            trace!(ethertype = frame.ethertype, "ignoring non-AVTP frame");
            return;
        }
        // Own transmissions reflected by the network; local delivery uses the loopback queue
        if frame.source == self.config.mac_address {
            trace!(source = %frame.source, "ignoring own frame");
            return;
        }
        self.counters.frames_rx = self.counters.frames_rx.wrapping_add(1);
        match ControlPdu::decode(&frame.payload) {
            Ok(pdu) => {
                trace!(subtype = %pdu.subtype(), source = %frame.source, "frame received");
                self.dispatch(pdu, frame.source, now);
                self.drain_loopback(now);
            }
            Err(e) => {
                warn!(source = %frame.source, len = frame.payload.len(), error = %e, "dropping malformed PDU");
            }
        }
    }

    /// Run timers: advertisements, directory sweep, retries, lock expiry
    pub fn poll(&mut self, now: Instant) {
        let gptp = self.gptp.current();
        if let Some(due) = self.adp.poll(now, gptp) {
            if due.grandmaster_changed {
                self.counters.gptp_gm_changed = self.counters.gptp_gm_changed.wrapping_add(1);
                info!(grandmaster = gptp.grandmaster_id, domain = gptp.domain_number, "local grandmaster changed");
                self.events.emit(AvdeccEvent::GrandmasterChanged {
                    entity_id: self.entity_id(),
                    grandmaster_id: gptp.grandmaster_id,
                    domain_number: gptp.domain_number,
                });
            }
            let pdu = self.adp.advertisement(&mut self.entity, gptp);
            self.send_logged(MacAddress::AVDECC_MULTICAST, ControlPdu::Adp(pdu));
        }

        for entity in self.directory.sweep(now) {
            self.entity_gone(entity.entity_id(), DepartureReason::Timeout);
        }

        for (destination, pdu) in self.controller.poll(now) {
            debug!(target = %pdu.target_entity_id, sequence_id = pdu.sequence_id, "retrying AECP command");
            self.send_logged(destination, ControlPdu::Aecp(pdu));
        }

        let out = self.acmp.poll(now);
        self.flush_acmp(out);

        if let Some(event) = self.responder.poll(now) {
            self.events.emit(event);
        }
        self.drain_loopback(now);
    }

    /// Serve one application request
    pub(crate) fn submit(&mut self, request: Request, now: Instant) {
        match request {
            Request::Entities { reply } => send_reply(reply, Ok(self.directory.entities())),
            Request::Entity { entity_id, reply } => {
                send_reply(reply, Ok(self.directory.get(entity_id).cloned()));
            }
            Request::Discover { entity_id, reply } => {
                debug!(%entity_id, "sending ENTITY_DISCOVER");
                let pdu = ControlPdu::Adp(AdpPdu::discover(entity_id));
                send_reply(reply, self.send(MacAddress::AVDECC_MULTICAST, pdu));
            }
            Request::CachedDescriptor {
                entity_id,
                descriptor,
                reply,
            } => {
                let cached = self.directory.cached_descriptor(entity_id, descriptor).cloned();
                send_reply(reply, Ok(cached));
            }
            Request::Aecp { command, reply } => self.start_aecp(command, reply, now),
            Request::Acmp { command, reply } => {
                if let Some((handle, out)) = self.acmp.begin_command(command, reply, now) {
                    let AcmpOutput { frames, events } = out;
                    self.publish(events);
                    for pdu in frames {
                        if let Err(e) = self.send(MacAddress::AVDECC_MULTICAST, ControlPdu::Acmp(pdu))
                        {
                            let out = self.acmp.fail(handle, e);
                            self.flush_acmp(out);
                        }
                    }
                }
            }
            Request::Connections { reply } => send_reply(reply, Ok(self.acmp.connections())),
        }
        self.drain_loopback(now);
    }

    fn start_aecp(&mut self, command: AecpPdu, reply: Reply<AecpPdu>, now: Instant) {
        let target = command.target_entity_id;
        let destination = if target == self.entity_id() {
            self.config.mac_address
        } else {
            self.directory
                .mac_address(target)
                .unwrap_or(MacAddress::AVDECC_MULTICAST)
        };
        let Some((handle, pdu)) = self.controller.begin(command, destination, reply, now) else {
            return;
        };
        debug!(%target, sequence_id = pdu.sequence_id, %destination, "AECP command started");
        if let Err(e) = self.send(destination, ControlPdu::Aecp(pdu)) {
            self.controller.fail(handle, e);
        }
    }

    /// Announce departure and fail everything still outstanding
    pub fn shutdown(&mut self) {
        if self.adp.is_running() {
            let pdu = self.adp.departing(&self.entity, self.gptp.current());
            self.send_logged(MacAddress::AVDECC_MULTICAST, ControlPdu::Adp(pdu));
            self.adp.stop();
        }
        self.controller.cancel_all();
        self.acmp.cancel_all();
        self.loopback.clear();
        info!(entity_id = %self.entity_id(), "AVDECC stack stopped");
    }

    fn dispatch(&mut self, pdu: ControlPdu, source: MacAddress, now: Instant) {
        match pdu {
            ControlPdu::Adp(pdu) => self.handle_adp(&pdu, source, now),
            ControlPdu::Aecp(pdu) => self.handle_aecp(&pdu, source, now),
            ControlPdu::Acmp(pdu) => {
                let out = self
                    .acmp
                    .handle_pdu(&pdu, &self.entity, self.streaming.as_mut(), now);
                self.flush_acmp(out);
            }
        }
    }

    fn handle_adp(&mut self, pdu: &AdpPdu, source: MacAddress, now: Instant) {
        let outcome = self
            .adp
            .handle_pdu(pdu, source, self.config.port, now, &mut self.directory);
        match outcome {
            AdpOutcome::Discovered(entity) => {
                self.events.emit(AvdeccEvent::EntityAvailable { entity });
            }
            AdpOutcome::Refreshed {
                entity,
                info_changed,
                grandmaster_changed,
            } => {
                if grandmaster_changed {
                    self.events.emit(AvdeccEvent::GrandmasterChanged {
                        entity_id: entity.entity_id(),
                        grandmaster_id: entity.info.gptp_grandmaster_id,
                        domain_number: entity.info.gptp_domain_number,
                    });
                }
                if info_changed {
                    self.events.emit(AvdeccEvent::EntityUpdated { entity });
                }
            }
            AdpOutcome::Restarted { entity, .. } => {
                self.entity_gone(entity.entity_id(), DepartureReason::Restarted);
                self.events.emit(AvdeccEvent::EntityAvailable { entity });
            }
            AdpOutcome::Departed(entity) => {
                self.entity_gone(entity.entity_id(), DepartureReason::Departing);
            }
            AdpOutcome::Ignored | AdpOutcome::Rejected | AdpOutcome::DiscoverScheduled => {}
        }
    }

    fn handle_aecp(&mut self, pdu: &AecpPdu, source: MacAddress, now: Instant) {
        let local_id = self.entity_id();
        if pdu.message_type.is_command() {
            if pdu.target_entity_id != local_id {
                return;
            }
            let mut ctx = ResponderContext {
                entity: &mut self.entity,
                streaming: self.streaming.as_mut(),
                acmp: &self.acmp,
                gptp: self.gptp.current(),
                counters: self.counters,
                now,
            };
            let output = self.responder.handle_command(pdu, source, &mut ctx);
            self.send_logged(source, ControlPdu::Aecp(output.response));
            for (destination, notification) in output.notifications {
                self.send_logged(destination, ControlPdu::Aecp(notification));
            }
            self.publish(output.events);
            return;
        }

        match self.controller.handle_response(pdu, now) {
            ControllerEvent::Completed { command, response } => {
                self.cache_descriptor(&command, &response);
            }
            ControllerEvent::Unsolicited(event) => self.events.emit(event),
            ControllerEvent::InProgress => {
                debug!(target = %pdu.target_entity_id, sequence_id = pdu.sequence_id, "command in progress");
            }
            ControllerEvent::Ignored => {}
        }
    }

    fn cache_descriptor(&mut self, command: &AecpPdu, response: &AecpPdu) {
        if command.aem_command_type() != Some(AemCommandType::READ_DESCRIPTOR)
            || !response.status.is_success()
        {
            return;
        }
        match ReadDescriptorResponse::decode(response.body.payload()) {
            Ok(read) => {
                let entity_id = response.target_entity_id;
                let reference = read.descriptor.reference();
                if self.directory.cache_descriptor(entity_id, read.descriptor) {
                    trace!(%entity_id, descriptor = %reference, "descriptor cached");
                }
            }
            Err(e) => {
                warn!(entity_id = %response.target_entity_id, error = %e, "undecodable READ_DESCRIPTOR response");
            }
        }
    }

    /// Forget every piece of state tied to an entity that left
    fn entity_gone(&mut self, entity_id: EntityId, reason: DepartureReason) {
        info!(%entity_id, ?reason, "entity departed");
        self.controller.entity_departed(entity_id);
        let out = self.acmp.entity_departed(entity_id, self.streaming.as_mut());
        self.flush_acmp(out);
        if let Some(event) = self.responder.entity_departed(entity_id) {
            self.events.emit(event);
        }
        self.events
            .emit(AvdeccEvent::EntityDeparted { entity_id, reason });
    }

    fn flush_acmp(&mut self, out: AcmpOutput) {
        let AcmpOutput { frames, events } = out;
        for pdu in frames {
            self.send_logged(MacAddress::AVDECC_MULTICAST, ControlPdu::Acmp(pdu));
        }
        self.publish(events);
    }

    fn publish(&self, events: Vec<AvdeccEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// Hand a PDU to the transport
    fn send(&mut self, destination: MacAddress, pdu: ControlPdu) -> Result<()> {
        let payload = pdu.encode();
        self.transport
            .send_frame(self.config.port, destination, AVTP_ETHERTYPE, payload)?;
        self.counters.frames_tx = self.counters.frames_tx.wrapping_add(1);
        if self.addressed_to_self(&pdu) {
            self.loopback.push_back(pdu);
        }
        Ok(())
    }

    /// Send a PDU nobody waits on; failures are only logged
    fn send_logged(&mut self, destination: MacAddress, pdu: ControlPdu) {
        let subtype = pdu.subtype();
        if let Err(e) = self.send(destination, pdu) {
            warn!(%subtype, %destination, error = %e, "failed to send PDU");
        }
    }

    /// PDUs the network does not echo back but the local entity must see
    fn addressed_to_self(&self, pdu: &ControlPdu) -> bool {
        let local_id = self.entity_id();
        match pdu {
            ControlPdu::Adp(_) => false,
            ControlPdu::Aecp(pdu) => {
                pdu.target_entity_id == local_id && pdu.controller_entity_id == local_id
            }
            ControlPdu::Acmp(pdu) => acmp_addressed_to(pdu, local_id),
        }
    }

    fn drain_loopback(&mut self, now: Instant) {
        let source = self.config.mac_address;
        for _ in 0..LOOPBACK_LIMIT {
            let Some(pdu) = self.loopback.pop_front() else {
                return;
            };
            trace!(subtype = %pdu.subtype(), "local delivery");
            self.dispatch(pdu, source, now);
        }
        if !self.loopback.is_empty() {
            warn!(queued = self.loopback.len(), "local delivery limit reached, dropping PDUs");
            self.loopback.clear();
        }
    }

    /// Run this stack on the current tokio runtime.
    ///
    /// `frames` carries the frames received on the stack's port.
    #[must_use]
    pub fn spawn(self, frames: tokio::sync::mpsc::Receiver<Frame>) -> AvdeccHandle {
        Runner::spawn(self, frames)
    }
}

/// Whether the local entity plays a role an ACMP PDU is addressed to
fn acmp_addressed_to(pdu: &AcmpPdu, local_id: EntityId) -> bool {
    match pdu.message_type {
        AcmpMessageType::ConnectTxCommand
        | AcmpMessageType::DisconnectTxCommand
        | AcmpMessageType::GetTxStateCommand
        | AcmpMessageType::GetTxConnectionCommand => pdu.talker_entity_id == local_id,
        AcmpMessageType::ConnectRxCommand
        | AcmpMessageType::DisconnectRxCommand
        | AcmpMessageType::GetRxStateCommand => pdu.listener_entity_id == local_id,
        AcmpMessageType::ConnectTxResponse | AcmpMessageType::DisconnectTxResponse => {
            pdu.listener_entity_id == local_id || pdu.controller_entity_id == local_id
        }
        _ => pdu.controller_entity_id == local_id,
    }
}
