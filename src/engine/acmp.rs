//! ACMP engine: talker, listener and controller roles.
//!
//! All ACMP traffic is multicast, so the engine only produces PDUs; the
//! stack sends every one of them to the AVDECC multicast address.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::entity_model::LocalEntity;
use super::{Reply, send_reply};
use crate::error::AvdeccError;
use crate::net::{StreamDirection, StreamHandle, StreamParams, StreamingBackend};
use crate::protocol::acmp::{AcmpFlags, AcmpMessageType, AcmpPdu, AcmpStatus};
use crate::state::AvdeccEvent;
use crate::transaction::{Completion, Expiry, TransactionHandle, TransactionTracker};
use crate::types::{EntityId, MacAddress, StreamId};

/// Retries of the CONNECT_TX a listener sends on behalf of a CONNECT_RX.
/// Two attempts of 2000 ms fit in the controller's 4500 ms.
const LISTENER_CONNECT_RETRIES: u8 = 1;

/// State of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connect sent, waiting for the answer
    Connecting,
    /// Connected
    Connected,
    /// Disconnect sent, waiting for the answer
    Disconnecting,
}

/// A talker to listener stream binding as seen by this stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConnection {
    /// Talker entity
    pub talker_entity_id: EntityId,
    /// Talker stream index
    pub talker_unique_id: u16,
    /// Listener entity
    pub listener_entity_id: EntityId,
    /// Listener stream index
    pub listener_unique_id: u16,
    /// Stream id allocated by the talker
    pub stream_id: StreamId,
    /// Destination MAC of the stream
    pub stream_dest_mac: MacAddress,
    /// VLAN of the stream
    pub stream_vlan_id: u16,
    /// Listeners of the talker stream when last reported
    pub connection_count: u16,
    /// Connection flags
    pub flags: AcmpFlags,
    /// Current state
    pub state: ConnectionState,
}

impl StreamConnection {
    pub(crate) fn from_pdu(pdu: &AcmpPdu, state: ConnectionState) -> Self {
        Self {
            talker_entity_id: pdu.talker_entity_id,
            talker_unique_id: pdu.talker_unique_id,
            listener_entity_id: pdu.listener_entity_id,
            listener_unique_id: pdu.listener_unique_id,
            stream_id: pdu.stream_id,
            stream_dest_mac: pdu.stream_dest_mac,
            stream_vlan_id: pdu.stream_vlan_id,
            connection_count: pdu.connection_count,
            flags: pdu.flags,
            state,
        }
    }

    /// `(entity, unique id)` of the talker
    #[must_use]
    pub fn talker(&self) -> (EntityId, u16) {
        (self.talker_entity_id, self.talker_unique_id)
    }

    /// `(entity, unique id)` of the listener
    #[must_use]
    pub fn listener(&self) -> (EntityId, u16) {
        (self.listener_entity_id, self.listener_unique_id)
    }

    /// Copy the stream fields into `pdu`
    fn fill(&self, pdu: &mut AcmpPdu) {
        pdu.talker_entity_id = self.talker_entity_id;
        pdu.talker_unique_id = self.talker_unique_id;
        pdu.stream_id = self.stream_id;
        pdu.stream_dest_mac = self.stream_dest_mac;
        pdu.stream_vlan_id = self.stream_vlan_id;
        pdu.flags = self.flags;
    }
}

/// PDUs to send and events to publish
#[derive(Debug, Default)]
pub struct AcmpOutput {
    /// PDUs for the multicast address
    pub frames: Vec<AcmpPdu>,
    /// Events for the application
    pub events: Vec<AvdeccEvent>,
}

impl AcmpOutput {
    fn changed(&mut self, connection: StreamConnection) {
        self.events.push(AvdeccEvent::ConnectionChanged { connection });
    }
}

#[derive(Debug)]
enum Pending {
    /// Request of the local controller
    Controller {
        command: AcmpPdu,
        reply: Reply<AcmpPdu>,
    },
    /// CONNECT_TX sent while serving `origin`, a CONNECT_RX
    ListenerConnect { command: AcmpPdu, origin: AcmpPdu },
    /// DISCONNECT_TX sent while serving `origin`, a DISCONNECT_RX
    ListenerDisconnect { command: AcmpPdu, origin: AcmpPdu },
    /// DISCONNECT_TX releasing a talker after a failed bind
    Release { command: AcmpPdu },
}

impl Pending {
    fn command(&self) -> &AcmpPdu {
        match self {
            Self::Controller { command, .. }
            | Self::ListenerConnect { command, .. }
            | Self::ListenerDisconnect { command, .. }
            | Self::Release { command } => command,
        }
    }

    fn command_mut(&mut self) -> &mut AcmpPdu {
        match self {
            Self::Controller { command, .. }
            | Self::ListenerConnect { command, .. }
            | Self::ListenerDisconnect { command, .. }
            | Self::Release { command } => command,
        }
    }
}

#[derive(Debug)]
struct ListenerSlot {
    connection: StreamConnection,
    pending: Option<TransactionHandle>,
}

fn is_tx(message_type: AcmpMessageType) -> bool {
    matches!(
        message_type.command(),
        AcmpMessageType::ConnectTxCommand
            | AcmpMessageType::DisconnectTxCommand
            | AcmpMessageType::GetTxStateCommand
            | AcmpMessageType::GetTxConnectionCommand
    )
}

/// Entity a command is addressed to, and the key its responses come back on
fn target(pdu: &AcmpPdu) -> EntityId {
    if is_tx(pdu.message_type) {
        pdu.talker_entity_id
    } else {
        pdu.listener_entity_id
    }
}

/// Whether `response` answers `command`
fn answers(command: &AcmpPdu, response: &AcmpPdu) -> bool {
    let talker_echoed = command.message_type == AcmpMessageType::GetRxStateCommand
        || (response.talker_entity_id == command.talker_entity_id
            && response.talker_unique_id == command.talker_unique_id);
    let listener_echoed = command.message_type == AcmpMessageType::GetTxConnectionCommand
        || (response.listener_entity_id == command.listener_entity_id
            && response.listener_unique_id == command.listener_unique_id);
    response.message_type == command.message_type.response()
        && response.controller_entity_id == command.controller_entity_id
        && talker_echoed
        && listener_echoed
}

/// Connection management for one entity
#[derive(Debug)]
pub struct AcmpEngine {
    local_id: EntityId,
    retries: u8,
    track_connections: bool,
    tracker: TransactionTracker<Pending>,
    /// Listeners of each local talker stream
    talkers: BTreeMap<u16, Vec<(EntityId, u16)>>,
    /// Local listener streams that are not disconnected
    listeners: BTreeMap<u16, ListenerSlot>,
    /// Connections known to the controller role, keyed by listener
    connections: BTreeMap<(EntityId, u16), StreamConnection>,
}

impl AcmpEngine {
    /// Engine for `local_id`. With `track_connections` the controller role
    /// keeps a table of every connection it sees.
    #[must_use]
    pub fn new(local_id: EntityId, retries: u8, capacity: usize, track_connections: bool) -> Self {
        Self {
            local_id,
            retries,
            track_connections,
            tracker: TransactionTracker::new("acmp", capacity),
            talkers: BTreeMap::new(),
            listeners: BTreeMap::new(),
            connections: BTreeMap::new(),
        }
    }

    /// Commands in flight
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Earliest retry or timeout
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tracker.next_deadline()
    }

    /// Listeners connected to local talker stream `index`
    #[must_use]
    pub fn talker_listeners(&self, index: u16) -> Vec<(EntityId, u16)> {
        self.talkers.get(&index).cloned().unwrap_or_default()
    }

    /// Connection of local listener stream `index`, if not disconnected
    #[must_use]
    pub fn listener_connection(&self, index: u16) -> Option<&StreamConnection> {
        self.listeners.get(&index).map(|s| &s.connection)
    }

    /// Whether a local stream is connected: a listener bound to its talker
    /// or a talker with at least one listener
    #[must_use]
    pub fn is_connected(&self, handle: StreamHandle) -> bool {
        match handle.direction {
            StreamDirection::Input => self
                .listeners
                .get(&handle.index)
                .is_some_and(|s| s.connection.state == ConnectionState::Connected),
            StreamDirection::Output => self
                .talkers
                .get(&handle.index)
                .is_some_and(|listeners| !listeners.is_empty()),
        }
    }

    /// Every connection known to the stack: the controller table plus the
    /// local listener streams
    #[must_use]
    pub fn connections(&self) -> Vec<StreamConnection> {
        let mut all = self.connections.clone();
        for (index, slot) in &self.listeners {
            all.entry((self.local_id, *index))
                .or_insert_with(|| slot.connection.clone());
        }
        all.into_values().collect()
    }

    /// Data plane parameters of a local stream
    #[must_use]
    pub fn stream_params(&self, handle: StreamHandle, entity: &LocalEntity) -> Option<StreamParams> {
        match handle.direction {
            StreamDirection::Output => {
                let talker = entity.talker(handle.index)?;
                Some(StreamParams {
                    handle,
                    stream_id: entity.stream_id(handle.index),
                    dest_mac: entity.stream_dest_mac(handle.index),
                    vlan_id: talker.vlan_id,
                    format: entity.stream_format(handle).unwrap_or(talker.format),
                    class_b: talker.class_b,
                    peer: EntityId::NONE,
                })
            }
            StreamDirection::Input => {
                let listener = entity.listener(handle.index)?;
                let connected = self
                    .listeners
                    .get(&handle.index)
                    .map(|s| &s.connection)
                    .filter(|c| c.state == ConnectionState::Connected);
                Some(StreamParams {
                    handle,
                    stream_id: connected.map_or_else(StreamId::default, |c| c.stream_id),
                    dest_mac: connected.map_or(MacAddress::ZERO, |c| c.stream_dest_mac),
                    vlan_id: connected.map_or(0, |c| c.stream_vlan_id),
                    format: entity.stream_format(handle).unwrap_or(listener.format),
                    class_b: connected.is_some_and(|c| c.flags.contains(AcmpFlags::CLASS_B)),
                    peer: connected.map_or(EntityId::NONE, |c| c.talker_entity_id),
                })
            }
        }
    }

    /// Start a controller command.
    ///
    /// Returns the transaction and the PDU to send, or `None` when the
    /// tracker is full; `reply` then already carries the error.
    pub(crate) fn begin_command(
        &mut self,
        mut command: AcmpPdu,
        reply: Reply<AcmpPdu>,
        now: Instant,
    ) -> Option<(TransactionHandle, AcmpOutput)> {
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
        let message_type = command.message_type;
        let pending = Pending::Controller {
            command: command.clone(),
            reply,
        };
        let (handle, sequence_id) = self
            .tracker
            .begin(target(&command), message_type.timeout(), self.retries, now, pending)
            .ok()?;
        command.sequence_id = sequence_id;
        if let Some(pending) = self.tracker.context_mut(handle) {
            pending.command_mut().sequence_id = sequence_id;
        }

        let mut out = AcmpOutput::default();
        let key = (command.listener_entity_id, command.listener_unique_id);
        match message_type {
            // A connected entry stays until the listener answers
            AcmpMessageType::ConnectRxCommand
                if !self
                    .connections
                    .get(&key)
                    .is_some_and(|c| c.state == ConnectionState::Connected) =>
            {
                let connecting = StreamConnection::from_pdu(&command, ConnectionState::Connecting);
                let replaced = self.connections.insert(key, connecting.clone());
                if replaced.as_ref() != Some(&connecting) {
                    out.changed(connecting);
                }
            }
            AcmpMessageType::DisconnectRxCommand => {
                if let Some(connection) = self.connections.get_mut(&key) {
                    connection.state = ConnectionState::Disconnecting;
                    out.changed(connection.clone());
                }
            }
            _ => {}
        }
        debug!(%message_type, target = %target(&command), sequence_id, "ACMP command started");
        out.frames.push(command);
        Some((handle, out))
    }

    /// Abort a controller command whose frame could not be sent
    pub(crate) fn fail(&mut self, handle: TransactionHandle, error: AvdeccError) -> AcmpOutput {
        let mut out = AcmpOutput::default();
        if let Some(pending) = self.tracker.cancel(handle) {
            self.abandon(pending, error, &mut out);
        }
        out
    }

    /// Process one inbound ACMP PDU
    pub fn handle_pdu(
        &mut self,
        pdu: &AcmpPdu,
        entity: &LocalEntity,
        streaming: &mut dyn StreamingBackend,
        now: Instant,
    ) -> AcmpOutput {
        let mut out = AcmpOutput::default();
        if !pdu.message_type.is_command() {
            self.handle_response(pdu, entity, streaming, now, &mut out);
        } else if is_tx(pdu.message_type) {
            if pdu.talker_entity_id == self.local_id {
                self.talker_command(pdu, entity, streaming, &mut out);
            }
        } else if pdu.listener_entity_id == self.local_id {
            self.listener_command(pdu, entity, streaming, now, &mut out);
        }
        out
    }

    fn talker_command(
        &mut self,
        command: &AcmpPdu,
        entity: &LocalEntity,
        streaming: &mut dyn StreamingBackend,
        out: &mut AcmpOutput,
    ) {
        let index = command.talker_unique_id;
        let Some(params) = self.stream_params(StreamHandle::output(index), entity) else {
            debug!(unique_id = index, "ACMP command for unknown talker stream");
            out.frames.push(command.to_response(AcmpStatus::TalkerUnknownId));
            return;
        };
        let listener = (command.listener_entity_id, command.listener_unique_id);
        let mut response = command.to_response(AcmpStatus::Success);

        let status = match command.message_type {
            AcmpMessageType::ConnectTxCommand => {
                self.connect_tx(index, listener, command.flags, entity, &params, streaming)
            }
            AcmpMessageType::DisconnectTxCommand => self.disconnect_tx(index, listener, streaming),
            AcmpMessageType::GetTxConnectionCommand => {
                match self
                    .talkers
                    .get(&index)
                    .and_then(|l| l.get(usize::from(command.connection_count)))
                {
                    Some(&(listener_id, listener_unique_id)) => {
                        response.listener_entity_id = listener_id;
                        response.listener_unique_id = listener_unique_id;
                        AcmpStatus::Success
                    }
                    None => AcmpStatus::NoSuchConnection,
                }
            }
            _ => AcmpStatus::Success,
        };

        response.status = status;
        response.stream_id = params.stream_id;
        response.stream_dest_mac = params.dest_mac;
        response.stream_vlan_id = params.vlan_id;
        response.flags.set(AcmpFlags::CLASS_B, params.class_b);
        response.connection_count = self
            .talkers
            .get(&index)
            .map_or(0, |l| u16::try_from(l.len()).unwrap_or(u16::MAX));
        out.frames.push(response);
    }

    fn connect_tx(
        &mut self,
        index: u16,
        listener: (EntityId, u16),
        flags: AcmpFlags,
        entity: &LocalEntity,
        params: &StreamParams,
        streaming: &mut dyn StreamingBackend,
    ) -> AcmpStatus {
        let Some(config) = entity.talker(index) else {
            return AcmpStatus::TalkerUnknownId;
        };
        if flags.contains(AcmpFlags::CLASS_B) != config.class_b {
            return AcmpStatus::IncompatibleRequest;
        }
        let connected = self.talkers.get(&index).map_or(0, Vec::len);
        if self
            .talkers
            .get(&index)
            .is_some_and(|l| l.contains(&listener))
        {
            return AcmpStatus::Success;
        }
        if config.exclusive && connected > 0 {
            return AcmpStatus::TalkerExclusive;
        }
        if config.max_listeners != 0 && connected >= usize::from(config.max_listeners) {
            return AcmpStatus::TalkerNoBandwidth;
        }
        if connected == 0 {
            if let Err(status) = streaming.reserve_talker(params) {
                warn!(unique_id = index, %status, "talker reservation refused");
                return status;
            }
        }
        self.talkers.entry(index).or_default().push(listener);
        info!(
            unique_id = index,
            listener = %listener.0,
            listener_unique_id = listener.1,
            "listener connected to talker stream"
        );
        AcmpStatus::Success
    }

    fn disconnect_tx(
        &mut self,
        index: u16,
        listener: (EntityId, u16),
        streaming: &mut dyn StreamingBackend,
    ) -> AcmpStatus {
        let Some(listeners) = self.talkers.get_mut(&index) else {
            return AcmpStatus::NotConnected;
        };
        let Some(position) = listeners.iter().position(|l| *l == listener) else {
            return AcmpStatus::NotConnected;
        };
        listeners.remove(position);
        info!(
            unique_id = index,
            listener = %listener.0,
            listener_unique_id = listener.1,
            "listener disconnected from talker stream"
        );
        if listeners.is_empty() {
            self.talkers.remove(&index);
            streaming.release_talker(StreamHandle::output(index));
        }
        AcmpStatus::Success
    }

    fn listener_command(
        &mut self,
        command: &AcmpPdu,
        entity: &LocalEntity,
        streaming: &mut dyn StreamingBackend,
        now: Instant,
        out: &mut AcmpOutput,
    ) {
        let index = command.listener_unique_id;
        if entity.listener(index).is_none() {
            debug!(unique_id = index, "ACMP command for unknown listener stream");
            out.frames.push(command.to_response(AcmpStatus::ListenerUnknownId));
            return;
        }
        match command.message_type {
            AcmpMessageType::ConnectRxCommand => self.connect_rx(command, now, out),
            AcmpMessageType::DisconnectRxCommand => {
                self.disconnect_rx(command, streaming, now, out);
            }
            _ => {
                let mut response = command.to_response(AcmpStatus::Success);
                match self.listeners.get(&index) {
                    Some(slot) => {
                        slot.connection.fill(&mut response);
                        response.connection_count =
                            u16::from(slot.connection.state == ConnectionState::Connected);
                    }
                    None => {
                        response.talker_entity_id = EntityId::NONE;
                        response.talker_unique_id = 0;
                        response.stream_id = StreamId::default();
                        response.stream_dest_mac = MacAddress::ZERO;
                        response.stream_vlan_id = 0;
                        response.connection_count = 0;
                    }
                }
                out.frames.push(response);
            }
        }
    }

    fn connect_rx(&mut self, command: &AcmpPdu, now: Instant, out: &mut AcmpOutput) {
        let index = command.listener_unique_id;
        let talker = (command.talker_entity_id, command.talker_unique_id);

        if let Some(slot) = self.listeners.get(&index) {
            if slot.connection.talker() != talker {
                out.frames.push(command.to_response(AcmpStatus::ListenerExclusive));
                return;
            }
            match slot.connection.state {
                ConnectionState::Connected => {
                    let mut response = command.to_response(AcmpStatus::Success);
                    slot.connection.fill(&mut response);
                    response.connection_count = slot.connection.connection_count;
                    out.frames.push(response);
                }
                ConnectionState::Connecting => {
                    // Controller retry: answer it instead of the first attempt
                    if let Some(Pending::ListenerConnect { origin, .. }) =
                        slot.pending.and_then(|h| self.tracker.context_mut(h))
                    {
                        *origin = command.clone();
                    }
                    debug!(unique_id = index, "connect already in progress");
                }
                ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                    out.frames.push(command.to_response(AcmpStatus::StateUnavailable));
                }
            }
            return;
        }

        if self.tracker.is_full() {
            warn!(unique_id = index, "no slot for CONNECT_TX");
            out.frames.push(command.to_response(AcmpStatus::CouldNotSendMessage));
            return;
        }
        let mut connect_tx = command.clone();
        connect_tx.message_type = AcmpMessageType::ConnectTxCommand;
        let pending = Pending::ListenerConnect {
            command: connect_tx.clone(),
            origin: command.clone(),
        };
        let Ok((handle, sequence_id)) = self.tracker.begin(
            talker.0,
            AcmpMessageType::ConnectTxCommand.timeout(),
            LISTENER_CONNECT_RETRIES,
            now,
            pending,
        ) else {
            out.frames.push(command.to_response(AcmpStatus::CouldNotSendMessage));
            return;
        };
        connect_tx.sequence_id = sequence_id;
        if let Some(pending) = self.tracker.context_mut(handle) {
            pending.command_mut().sequence_id = sequence_id;
        }

        let connection = StreamConnection::from_pdu(command, ConnectionState::Connecting);
        out.changed(connection.clone());
        self.listeners.insert(
            index,
            ListenerSlot {
                connection,
                pending: Some(handle),
            },
        );
        info!(unique_id = index, talker = %talker.0, talker_unique_id = talker.1, "connecting listener stream");
        out.frames.push(connect_tx);
    }

    fn disconnect_rx(
        &mut self,
        command: &AcmpPdu,
        streaming: &mut dyn StreamingBackend,
        now: Instant,
        out: &mut AcmpOutput,
    ) {
        let index = command.listener_unique_id;
        let talker = (command.talker_entity_id, command.talker_unique_id);
        let state = match self.listeners.get(&index) {
            Some(slot) if slot.connection.talker() == talker => slot.connection.state,
            _ => ConnectionState::Disconnected,
        };
        match state {
            ConnectionState::Disconnected => {
                out.frames.push(command.to_response(AcmpStatus::NotConnected));
                return;
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                out.frames.push(command.to_response(AcmpStatus::StateUnavailable));
                return;
            }
            ConnectionState::Connected => {}
        }

        streaming.unbind_listener(StreamHandle::input(index));
        let mut disconnect_tx = command.clone();
        disconnect_tx.message_type = AcmpMessageType::DisconnectTxCommand;
        let pending = Pending::ListenerDisconnect {
            command: disconnect_tx.clone(),
            origin: command.clone(),
        };
        let started = self
            .tracker
            .begin(
                talker.0,
                AcmpMessageType::DisconnectTxCommand.timeout(),
                0,
                now,
                pending,
            )
            .ok();
        let Some((handle, sequence_id)) = started else {
            // The listener side is released either way
            warn!(unique_id = index, "no slot for DISCONNECT_TX, talker not notified");
            if let Some(slot) = self.listeners.remove(&index) {
                out.changed(StreamConnection {
                    state: ConnectionState::Disconnected,
                    ..slot.connection
                });
            }
            out.frames.push(command.to_response(AcmpStatus::Success));
            return;
        };
        disconnect_tx.sequence_id = sequence_id;
        if let Some(pending) = self.tracker.context_mut(handle) {
            pending.command_mut().sequence_id = sequence_id;
        }
        if let Some(slot) = self.listeners.get_mut(&index) {
            slot.connection.state = ConnectionState::Disconnecting;
            slot.pending = Some(handle);
            out.changed(slot.connection.clone());
        }
        out.frames.push(disconnect_tx);
    }

    fn handle_response(
        &mut self,
        response: &AcmpPdu,
        entity: &LocalEntity,
        streaming: &mut dyn StreamingBackend,
        now: Instant,
        out: &mut AcmpOutput,
    ) {
        // CONNECT_TX and DISCONNECT_TX are only ever sent by the listener role
        let ours = match response.message_type.command() {
            AcmpMessageType::ConnectTxCommand | AcmpMessageType::DisconnectTxCommand => {
                response.listener_entity_id == self.local_id
            }
            _ => response.controller_entity_id == self.local_id,
        };
        if ours {
            let key = target(response);
            let sequence_id = response.sequence_id;
            match self.tracker.lookup(key, sequence_id) {
                Some((_, pending)) if answers(pending.command(), response) => {
                    if let Completion::Matched { context, .. } =
                        self.tracker.complete(key, sequence_id)
                    {
                        self.finish(context, response, entity, streaming, now, out);
                    }
                    return;
                }
                Some(_) => {
                    warn!(%key, sequence_id, message_type = %response.message_type, "ACMP response does not match the pending command");
                }
                None => {
                    // Lets the tracker report duplicates
                    let _ = self.tracker.complete(key, sequence_id);
                }
            }
        }
        self.observe(response, out);
    }

    /// Update the controller table from a response another controller
    /// caused
    fn observe(&mut self, response: &AcmpPdu, out: &mut AcmpOutput) {
        if !self.track_connections || !response.status.is_success() {
            return;
        }
        let key = (response.listener_entity_id, response.listener_unique_id);
        match response.message_type {
            AcmpMessageType::ConnectRxResponse => {
                let connection = StreamConnection::from_pdu(response, ConnectionState::Connected);
                if self.connections.get(&key) != Some(&connection) {
                    self.connections.insert(key, connection.clone());
                    out.changed(connection);
                }
            }
            AcmpMessageType::DisconnectRxResponse => {
                if let Some(connection) = self.connections.remove(&key) {
                    out.changed(StreamConnection {
                        state: ConnectionState::Disconnected,
                        ..connection
                    });
                }
            }
            _ => {}
        }
    }

    fn finish(
        &mut self,
        pending: Pending,
        response: &AcmpPdu,
        entity: &LocalEntity,
        streaming: &mut dyn StreamingBackend,
        now: Instant,
        out: &mut AcmpOutput,
    ) {
        match pending {
            Pending::Controller { command, reply } => {
                self.controller_result(&command, response, out);
                let result = if response.status.is_success() {
                    Ok(response.clone())
                } else {
                    Err(AvdeccError::AcmpStatus(response.status))
                };
                send_reply(reply, result);
            }
            Pending::ListenerConnect { origin, .. } => {
                self.listener_connected(&origin, response, entity, streaming, now, out);
            }
            Pending::ListenerDisconnect { origin, .. } => {
                let index = origin.listener_unique_id;
                if let Some(slot) = self.listeners.remove(&index) {
                    info!(unique_id = index, status = %response.status, "listener stream disconnected");
                    out.changed(StreamConnection {
                        state: ConnectionState::Disconnected,
                        ..slot.connection
                    });
                }
                out.frames.push(origin.to_response(response.status));
            }
            Pending::Release { command } => {
                debug!(talker = %command.talker_entity_id, status = %response.status, "talker released");
            }
        }
    }

    fn controller_result(&mut self, command: &AcmpPdu, response: &AcmpPdu, out: &mut AcmpOutput) {
        let key = (command.listener_entity_id, command.listener_unique_id);
        let success = response.status.is_success();
        match command.message_type {
            AcmpMessageType::ConnectRxCommand if success => {
                let connection = StreamConnection::from_pdu(response, ConnectionState::Connected);
                self.connections.insert(key, connection.clone());
                out.changed(connection);
            }
            AcmpMessageType::DisconnectRxCommand
                if success || response.status == AcmpStatus::NotConnected =>
            {
                if let Some(connection) = self.connections.remove(&key) {
                    out.changed(StreamConnection {
                        state: ConnectionState::Disconnected,
                        ..connection
                    });
                }
            }
            AcmpMessageType::GetRxStateCommand if success => {
                if response.connection_count > 0 {
                    let connection =
                        StreamConnection::from_pdu(response, ConnectionState::Connected);
                    if self.connections.get(&key) != Some(&connection) {
                        self.connections.insert(key, connection.clone());
                        out.changed(connection);
                    }
                } else if let Some(connection) = self.connections.remove(&key) {
                    out.changed(StreamConnection {
                        state: ConnectionState::Disconnected,
                        ..connection
                    });
                }
            }
            AcmpMessageType::ConnectRxCommand | AcmpMessageType::DisconnectRxCommand => {
                self.revert(command, out);
            }
            _ => {}
        }
    }

    /// Undo the state change a failed controller command announced
    fn revert(&mut self, command: &AcmpPdu, out: &mut AcmpOutput) {
        let key = (command.listener_entity_id, command.listener_unique_id);
        let Some(connection) = self.connections.get_mut(&key) else {
            return;
        };
        match (command.message_type, connection.state) {
            (AcmpMessageType::ConnectRxCommand, ConnectionState::Connecting) => {
                if let Some(connection) = self.connections.remove(&key) {
                    out.changed(StreamConnection {
                        state: ConnectionState::Disconnected,
                        ..connection
                    });
                }
            }
            (AcmpMessageType::DisconnectRxCommand, ConnectionState::Disconnecting) => {
                connection.state = ConnectionState::Connected;
                out.changed(connection.clone());
            }
            _ => {}
        }
    }

    fn listener_connected(
        &mut self,
        origin: &AcmpPdu,
        response: &AcmpPdu,
        entity: &LocalEntity,
        streaming: &mut dyn StreamingBackend,
        now: Instant,
        out: &mut AcmpOutput,
    ) {
        let index = origin.listener_unique_id;
        if !self.listeners.contains_key(&index) {
            return;
        }
        if !response.status.is_success() {
            warn!(unique_id = index, status = %response.status, "talker refused connection");
            self.drop_listener(index, out);
            out.frames.push(origin.to_response(response.status));
            return;
        }

        let connection = StreamConnection::from_pdu(response, ConnectionState::Connected);
        let params = StreamParams {
            handle: StreamHandle::input(index),
            stream_id: response.stream_id,
            dest_mac: response.stream_dest_mac,
            vlan_id: response.stream_vlan_id,
            format: entity.stream_format(StreamHandle::input(index)).unwrap_or(0),
            class_b: response.flags.contains(AcmpFlags::CLASS_B),
            peer: response.talker_entity_id,
        };
        if let Err(status) = streaming.bind_listener(&params) {
            warn!(unique_id = index, %status, "listener bind failed, releasing talker");
            self.drop_listener(index, out);
            self.release_talker(response, now, out);
            out.frames.push(origin.to_response(AcmpStatus::ListenerMisbehaving));
            return;
        }

        let mut reply = origin.to_response(AcmpStatus::Success);
        connection.fill(&mut reply);
        reply.connection_count = response.connection_count;
        info!(
            unique_id = index,
            talker = %connection.talker_entity_id,
            stream_id = %connection.stream_id,
            "listener stream connected"
        );
        out.changed(connection.clone());
        self.listeners.insert(
            index,
            ListenerSlot {
                connection,
                pending: None,
            },
        );
        out.frames.push(reply);
    }

    fn drop_listener(&mut self, index: u16, out: &mut AcmpOutput) {
        if let Some(slot) = self.listeners.remove(&index) {
            out.changed(StreamConnection {
                state: ConnectionState::Disconnected,
                ..slot.connection
            });
        }
    }

    /// Fire-and-forget DISCONNECT_TX undoing a talker connect
    fn release_talker(&mut self, connect_response: &AcmpPdu, now: Instant, out: &mut AcmpOutput) {
        let mut command = connect_response.clone();
        command.message_type = AcmpMessageType::DisconnectTxCommand;
        command.status = AcmpStatus::Success;
        let timeout = AcmpMessageType::DisconnectTxCommand.timeout();
        let Ok((handle, sequence_id)) = self.tracker.begin(
            command.talker_entity_id,
            timeout,
            0,
            now,
            Pending::Release {
                command: command.clone(),
            },
        ) else {
            warn!(talker = %command.talker_entity_id, "no slot to release talker");
            return;
        };
        command.sequence_id = sequence_id;
        if let Some(pending) = self.tracker.context_mut(handle) {
            pending.command_mut().sequence_id = sequence_id;
        }
        out.frames.push(command);
    }

    /// Handle commands whose retries ran out; returns the PDUs to resend
    pub fn poll(&mut self, now: Instant) -> AcmpOutput {
        let mut out = AcmpOutput::default();
        for expiry in self.tracker.poll_expired(now) {
            match expiry {
                Expiry::Retry {
                    handle,
                    sequence_id,
                    ..
                } => {
                    if let Some(pending) = self.tracker.context_mut(handle) {
                        let command = pending.command_mut();
                        command.sequence_id = sequence_id;
                        out.frames.push(command.clone());
                    }
                }
                Expiry::TimedOut {
                    target, context, ..
                } => self.abandon(context, AvdeccError::Timeout { target }, &mut out),
            }
        }
        out
    }

    /// Settle a transaction that will never get its response
    fn abandon(&mut self, pending: Pending, error: AvdeccError, out: &mut AcmpOutput) {
        match pending {
            Pending::Controller { command, reply } => {
                self.revert(&command, out);
                send_reply(reply, Err(error));
            }
            Pending::ListenerConnect { origin, .. } => {
                warn!(unique_id = origin.listener_unique_id, talker = %origin.talker_entity_id, "talker did not answer CONNECT_TX");
                self.drop_listener(origin.listener_unique_id, out);
                out.frames.push(origin.to_response(AcmpStatus::ListenerTalkerTimeout));
            }
            Pending::ListenerDisconnect { origin, .. } => {
                // Already unbound locally, so the disconnect stands
                warn!(unique_id = origin.listener_unique_id, talker = %origin.talker_entity_id, "talker did not answer DISCONNECT_TX");
                self.drop_listener(origin.listener_unique_id, out);
                out.frames.push(origin.to_response(AcmpStatus::Success));
            }
            Pending::Release { command } => {
                warn!(talker = %command.talker_entity_id, "talker release unanswered");
            }
        }
    }

    /// Forget everything involving an entity that left the network
    pub fn entity_departed(
        &mut self,
        entity_id: EntityId,
        streaming: &mut dyn StreamingBackend,
    ) -> AcmpOutput {
        let mut out = AcmpOutput::default();
        for (_, pending) in self.tracker.cancel_target(entity_id) {
            self.abandon(pending, AvdeccError::EntityNotFound { entity_id }, &mut out);
        }

        let mut released = Vec::new();
        for (index, listeners) in &mut self.talkers {
            listeners.retain(|(listener, _)| *listener != entity_id);
            if listeners.is_empty() {
                released.push(*index);
            }
        }
        for index in released {
            self.talkers.remove(&index);
            info!(unique_id = index, "last listener departed, releasing talker stream");
            streaming.release_talker(StreamHandle::output(index));
        }

        let orphaned: Vec<u16> = self
            .listeners
            .iter()
            .filter(|(_, s)| s.connection.talker_entity_id == entity_id)
            .map(|(index, _)| *index)
            .collect();
        for index in orphaned {
            if let Some(slot) = self.listeners.get(&index) {
                if slot.connection.state == ConnectionState::Connected {
                    streaming.unbind_listener(StreamHandle::input(index));
                }
                if let Some(handle) = slot.pending {
                    self.tracker.cancel(handle);
                }
            }
            info!(unique_id = index, talker = %entity_id, "talker departed, listener stream disconnected");
            self.drop_listener(index, &mut out);
        }

        let gone: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, c)| c.talker_entity_id == entity_id || c.listener_entity_id == entity_id)
            .map(|(key, _)| *key)
            .collect();
        for key in gone {
            if let Some(connection) = self.connections.remove(&key) {
                out.changed(StreamConnection {
                    state: ConnectionState::Disconnected,
                    ..connection
                });
            }
        }
        out
    }

    /// Fail every outstanding controller command with `Cancelled`
    pub fn cancel_all(&mut self) {
        for handle in self.tracker.handles() {
            if let Some(Pending::Controller { reply, .. }) = self.tracker.cancel(handle) {
                send_reply(reply, Err(AvdeccError::Cancelled));
            }
        }
    }
}
