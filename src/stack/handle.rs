//! Application handle to a running stack

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use super::Request;
use crate::engine::{ConnectionState, Reply, StreamConnection};
use crate::error::{AvdeccError, Result};
use crate::protocol::acmp::{AcmpFlags, AcmpMessageType, AcmpPdu};
use crate::protocol::aecp::{AecpPdu, AemCommandType, MilanInfo, MvuCommandType};
use crate::protocol::aem::{
    AcquireFlags, ControlPayload, CountersResponse, Descriptor, DescriptorRef, DescriptorType,
    LockFlags, OwnershipPayload, ReadDescriptorCommand, ReadDescriptorResponse,
};
use crate::state::{AvdeccEvent, EventBus};
use crate::types::{EntityId, RemoteEntity};

/// Cloneable handle to a stack running on its own task.
///
/// Every call is a request to the runner's event loop; awaiting the answer
/// never blocks it.
#[derive(Debug, Clone)]
pub struct AvdeccHandle {
    pub(super) entity_id: EntityId,
    pub(super) requests: mpsc::Sender<Request>,
    pub(super) shutdown: Arc<watch::Sender<bool>>,
    pub(super) events: EventBus,
    pub(super) task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AvdeccHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| AvdeccError::NotReady)?;
        rx.await.map_err(|_| AvdeccError::NotReady)?
    }

    /// Id of the local entity
    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Event bus of the stack, for [`EventFilter`](crate::state::EventFilter)
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AvdeccEvent> {
        self.events.subscribe()
    }

    // ===== Discovery =====

    /// All known remote entities, ordered by id
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::NotReady` once the stack has stopped.
    pub async fn entities(&self) -> Result<Vec<RemoteEntity>> {
        self.request(|reply| Request::Entities { reply }).await
    }

    /// One remote entity, if known
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::NotReady` once the stack has stopped.
    pub async fn entity(&self, entity_id: EntityId) -> Result<Option<RemoteEntity>> {
        self.request(|reply| Request::Entity { entity_id, reply })
            .await
    }

    /// Ask one entity, or every entity when `None`, to advertise
    ///
    /// # Errors
    ///
    /// Returns a transport error if the DISCOVER could not be sent.
    pub async fn discover(&self, entity_id: Option<EntityId>) -> Result<()> {
        let entity_id = entity_id.unwrap_or(EntityId::NONE);
        self.request(|reply| Request::Discover { entity_id, reply })
            .await
    }

    // ===== Enumeration and control =====

    /// Send an AEM command and wait for its response
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus` for a non-success status,
    /// `AvdeccError::Timeout` when retries ran out and
    /// `AvdeccError::NoResources` when too many commands are in flight.
    pub async fn send_aem_command(
        &self,
        entity_id: EntityId,
        command_type: AemCommandType,
        payload: Bytes,
    ) -> Result<AecpPdu> {
        let command = AecpPdu::aem_command(entity_id, self.entity_id, command_type, payload);
        self.request(|reply| Request::Aecp { command, reply }).await
    }

    /// Send a vendor-unique command and wait for its response
    ///
    /// # Errors
    ///
    /// Same as [`send_aem_command`](Self::send_aem_command).
    pub async fn send_vendor_unique(
        &self,
        entity_id: EntityId,
        protocol_id: u64,
        payload: Bytes,
    ) -> Result<AecpPdu> {
        let command =
            AecpPdu::vendor_unique_command(entity_id, self.entity_id, protocol_id, payload);
        self.request(|reply| Request::Aecp { command, reply }).await
    }

    /// Milan GET_MILAN_INFO
    ///
    /// # Errors
    ///
    /// Same as [`send_aem_command`](Self::send_aem_command), plus
    /// `AvdeccError::Pdu` for a truncated answer.
    pub async fn get_milan_info(&self, entity_id: EntityId) -> Result<MilanInfo> {
        let command = AecpPdu::milan_command(
            entity_id,
            self.entity_id,
            MvuCommandType::GET_MILAN_INFO,
            Bytes::new(),
        );
        let response = self
            .request(|reply| Request::Aecp { command, reply })
            .await?;
        Ok(MilanInfo::decode(response.body.payload())?)
    }

    /// Read a descriptor of configuration 0, from the cache when possible
    ///
    /// # Errors
    ///
    /// Same as [`send_aem_command`](Self::send_aem_command), plus
    /// `AvdeccError::UnexpectedResponse` when another descriptor comes back.
    pub async fn read_descriptor(
        &self,
        entity_id: EntityId,
        descriptor: DescriptorRef,
    ) -> Result<Descriptor> {
        let cached = self
            .request(|reply| Request::CachedDescriptor {
                entity_id,
                descriptor,
                reply,
            })
            .await?;
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let payload = ReadDescriptorCommand {
            configuration_index: 0,
            descriptor,
        }
        .encode();
        let response = self
            .send_aem_command(entity_id, AemCommandType::READ_DESCRIPTOR, payload)
            .await?;
        let read = ReadDescriptorResponse::decode(response.body.payload())?;
        if read.descriptor.reference() != descriptor {
            return Err(AvdeccError::UnexpectedResponse {
                expected: descriptor.to_string(),
                actual: read.descriptor.reference().to_string(),
            });
        }
        Ok(read.descriptor)
    }

    async fn ownership(
        &self,
        entity_id: EntityId,
        command_type: AemCommandType,
        flags: u32,
    ) -> Result<EntityId> {
        let payload = OwnershipPayload {
            flags,
            owner_id: EntityId::NONE,
            descriptor: DescriptorRef::entity(),
        }
        .encode();
        let response = self
            .send_aem_command(entity_id, command_type, payload)
            .await?;
        Ok(OwnershipPayload::decode(response.body.payload())?.owner_id)
    }

    /// ACQUIRE_ENTITY; returns the owner, which is the local entity
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(EntityAcquired)` when another
    /// controller owns the entity.
    pub async fn acquire_entity(&self, entity_id: EntityId, persistent: bool) -> Result<EntityId> {
        let flags = if persistent {
            AcquireFlags::PERSISTENT.0
        } else {
            0
        };
        self.ownership(entity_id, AemCommandType::ACQUIRE_ENTITY, flags)
            .await
    }

    /// ACQUIRE_ENTITY with the RELEASE flag
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(EntityAcquired)` when another
    /// controller owns the entity.
    pub async fn release_entity(&self, entity_id: EntityId) -> Result<()> {
        self.ownership(
            entity_id,
            AemCommandType::ACQUIRE_ENTITY,
            AcquireFlags::RELEASE.0,
        )
        .await
        .map(|_| ())
    }

    /// LOCK_ENTITY; returns the lock owner
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(EntityLocked)` when another
    /// controller holds the lock.
    pub async fn lock_entity(&self, entity_id: EntityId) -> Result<EntityId> {
        self.ownership(entity_id, AemCommandType::LOCK_ENTITY, 0)
            .await
    }

    /// LOCK_ENTITY with the UNLOCK flag
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(EntityLocked)` when another
    /// controller holds the lock.
    pub async fn unlock_entity(&self, entity_id: EntityId) -> Result<()> {
        self.ownership(entity_id, AemCommandType::LOCK_ENTITY, LockFlags::UNLOCK.0)
            .await
            .map(|_| ())
    }

    /// START_STREAMING on a STREAM_INPUT or STREAM_OUTPUT
    ///
    /// # Errors
    ///
    /// Returns the AECP status the entity refused with.
    pub async fn start_streaming(&self, entity_id: EntityId, stream: DescriptorRef) -> Result<()> {
        self.send_aem_command(entity_id, AemCommandType::START_STREAMING, stream.encode())
            .await
            .map(|_| ())
    }

    /// STOP_STREAMING on a STREAM_INPUT or STREAM_OUTPUT
    ///
    /// # Errors
    ///
    /// Returns the AECP status the entity refused with.
    pub async fn stop_streaming(&self, entity_id: EntityId, stream: DescriptorRef) -> Result<()> {
        self.send_aem_command(entity_id, AemCommandType::STOP_STREAMING, stream.encode())
            .await
            .map(|_| ())
    }

    /// SET_CONTROL; returns the values now in effect
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(BadArguments)` for out of range
    /// values, or the access status when another controller owns the entity.
    pub async fn set_control(
        &self,
        entity_id: EntityId,
        control_index: u16,
        values: Bytes,
    ) -> Result<Bytes> {
        let payload = ControlPayload {
            descriptor: DescriptorRef::new(DescriptorType::Control, control_index),
            values,
        }
        .encode();
        let response = self
            .send_aem_command(entity_id, AemCommandType::SET_CONTROL, payload)
            .await?;
        Ok(ControlPayload::decode(response.body.payload())?.values)
    }

    /// GET_CONTROL
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(NoSuchDescriptor)` for unknown
    /// controls.
    pub async fn get_control(&self, entity_id: EntityId, control_index: u16) -> Result<Bytes> {
        let payload = DescriptorRef::new(DescriptorType::Control, control_index).encode();
        let response = self
            .send_aem_command(entity_id, AemCommandType::GET_CONTROL, payload)
            .await?;
        Ok(ControlPayload::decode(response.body.payload())?.values)
    }

    /// GET_COUNTERS
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(NoSuchDescriptor)` for descriptors
    /// without counters.
    pub async fn get_counters(
        &self,
        entity_id: EntityId,
        descriptor: DescriptorRef,
    ) -> Result<CountersResponse> {
        let response = self
            .send_aem_command(entity_id, AemCommandType::GET_COUNTERS, descriptor.encode())
            .await?;
        Ok(CountersResponse::decode(response.body.payload())?)
    }

    /// REGISTER_UNSOLICITED_NOTIFICATION
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AecpStatus(NoResources)` when the entity has no
    /// registration slot left.
    pub async fn register_notifications(&self, entity_id: EntityId) -> Result<()> {
        self.send_aem_command(
            entity_id,
            AemCommandType::REGISTER_UNSOLICITED_NOTIFICATION,
            Bytes::new(),
        )
        .await
        .map(|_| ())
    }

    /// DEREGISTER_UNSOLICITED_NOTIFICATION
    ///
    /// # Errors
    ///
    /// Returns the AECP status the entity refused with.
    pub async fn deregister_notifications(&self, entity_id: EntityId) -> Result<()> {
        self.send_aem_command(
            entity_id,
            AemCommandType::DEREGISTER_UNSOLICITED_NOTIFICATION,
            Bytes::new(),
        )
        .await
        .map(|_| ())
    }

    // ===== Connection management =====

    async fn acmp(
        &self,
        message_type: AcmpMessageType,
        talker: (EntityId, u16),
        listener: (EntityId, u16),
        adjust: impl FnOnce(&mut AcmpPdu),
    ) -> Result<AcmpPdu> {
        let mut command = AcmpPdu::command(message_type, self.entity_id, talker, listener);
        adjust(&mut command);
        self.request(|reply| Request::Acmp { command, reply }).await
    }

    /// Connect a listener stream to a talker stream
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AcmpStatus` with the listener's or talker's
    /// refusal, for example `TalkerNoBandwidth`.
    pub async fn connect_stream(
        &self,
        talker: (EntityId, u16),
        listener: (EntityId, u16),
    ) -> Result<StreamConnection> {
        self.connect_stream_with_flags(talker, listener, AcmpFlags::default())
            .await
    }

    /// Connect with explicit flags, for example `CLASS_B`
    ///
    /// # Errors
    ///
    /// Same as [`connect_stream`](Self::connect_stream).
    pub async fn connect_stream_with_flags(
        &self,
        talker: (EntityId, u16),
        listener: (EntityId, u16),
        flags: AcmpFlags,
    ) -> Result<StreamConnection> {
        let response = self
            .acmp(AcmpMessageType::ConnectRxCommand, talker, listener, |c| {
                c.flags = flags;
            })
            .await?;
        Ok(StreamConnection::from_pdu(
            &response,
            ConnectionState::Connected,
        ))
    }

    /// Disconnect a listener stream
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AcmpStatus(NotConnected)` when the pair was not
    /// connected.
    pub async fn disconnect_stream(
        &self,
        talker: (EntityId, u16),
        listener: (EntityId, u16),
    ) -> Result<()> {
        self.acmp(AcmpMessageType::DisconnectRxCommand, talker, listener, |_| {})
            .await
            .map(|_| ())
    }

    /// Connection state of a listener stream, as the listener reports it
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AcmpStatus(ListenerUnknownId)` for unknown
    /// streams.
    pub async fn get_rx_state(&self, listener: (EntityId, u16)) -> Result<StreamConnection> {
        let response = self
            .acmp(
                AcmpMessageType::GetRxStateCommand,
                (EntityId::NONE, 0),
                listener,
                |_| {},
            )
            .await?;
        let state = if response.connection_count > 0 {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        Ok(StreamConnection::from_pdu(&response, state))
    }

    /// Talker stream state: stream id, destination and `connection_count`
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AcmpStatus(TalkerUnknownId)` for unknown
    /// streams.
    pub async fn get_tx_state(&self, talker: (EntityId, u16)) -> Result<AcmpPdu> {
        self.acmp(
            AcmpMessageType::GetTxStateCommand,
            talker,
            (EntityId::NONE, 0),
            |_| {},
        )
        .await
    }

    /// Listener number `index` of a talker stream
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::AcmpStatus(NoSuchConnection)` past the last
    /// listener.
    pub async fn get_tx_connection(
        &self,
        talker: (EntityId, u16),
        index: u16,
    ) -> Result<(EntityId, u16)> {
        let response = self
            .acmp(
                AcmpMessageType::GetTxConnectionCommand,
                talker,
                (EntityId::NONE, 0),
                |c| c.connection_count = index,
            )
            .await?;
        Ok((response.listener_entity_id, response.listener_unique_id))
    }

    /// Connections known to the local controller
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::NotReady` once the stack has stopped.
    pub async fn connections(&self) -> Result<Vec<StreamConnection>> {
        self.request(|reply| Request::Connections { reply }).await
    }

    // ===== Lifecycle =====

    /// Send ENTITY_DEPARTING, fail outstanding commands and stop the runner.
    ///
    /// Other clones of this handle get `NotReady` afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::NotReady` if the runner task panicked.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "AVDECC runner ended abnormally");
                return Err(AvdeccError::NotReady);
            }
        }
        Ok(())
    }
}
