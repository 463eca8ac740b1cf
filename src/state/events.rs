//! Event bus for stack notifications

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::engine::StreamConnection;
use crate::net::StreamHandle;
use crate::protocol::aecp::{AecpStatus, AemCommandType};
use crate::protocol::aem::DescriptorRef;
use crate::types::{EntityId, RemoteEntity};

/// Why an entity left the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureReason {
    /// It sent ENTITY_DEPARTING
    Departing,
    /// No advertisement within its valid time
    Timeout,
    /// Its `available_index` did not advance
    Restarted,
}

/// Notifications published by the stack
#[derive(Debug, Clone)]
pub enum AvdeccEvent {
    // Discovery events
    /// Entity seen for the first time, or again after a restart
    EntityAvailable {
        /// Directory entry
        entity: RemoteEntity,
    },
    /// Entity re-advertised with different information
    EntityUpdated {
        /// Directory entry
        entity: RemoteEntity,
    },
    /// Entity removed from the directory
    EntityDeparted {
        /// Entity that left
        entity_id: EntityId,
        /// Cause
        reason: DepartureReason,
    },
    /// A grandmaster change was observed, locally or in an advertisement
    GrandmasterChanged {
        /// Entity whose grandmaster changed; the local id for our own clock
        entity_id: EntityId,
        /// New grandmaster
        grandmaster_id: u64,
        /// gPTP domain
        domain_number: u8,
    },

    // Enumeration and control events
    /// Unsolicited AEM response addressed to the local controller
    UnsolicitedResponse {
        /// Entity that sent it
        entity_id: EntityId,
        /// Command it reports on
        command_type: AemCommandType,
        /// Status of the notification
        status: AecpStatus,
        /// Command specific payload
        payload: Bytes,
    },
    /// Acquire or lock state of the local entity changed
    OwnershipChanged {
        /// Controller holding the acquisition
        acquired_by: Option<EntityId>,
        /// Controller holding the lock
        locked_by: Option<EntityId>,
    },
    /// A remote controller changed a local control
    ControlChanged {
        /// CONTROL descriptor index
        control_index: u16,
        /// New value bytes
        values: Bytes,
    },
    /// A remote controller changed the format of a local stream
    StreamFormatChanged {
        /// Local stream
        handle: StreamHandle,
        /// New format
        format: u64,
    },
    /// A remote controller renamed a local descriptor
    NameChanged {
        /// Renamed descriptor
        descriptor: DescriptorRef,
        /// Which of its names; ENTITY has entity and group name
        name_index: u16,
        /// New name
        name: String,
    },
    /// A local stream was started or stopped by START/STOP_STREAMING
    StreamingChanged {
        /// Local stream
        handle: StreamHandle,
        /// Whether it is now running
        running: bool,
    },

    // Connection events
    /// A stream connection known to this stack changed state
    ConnectionChanged {
        /// Connection after the change
        connection: StreamConnection,
    },
}

/// Event bus for distributing events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AvdeccEvent>,
}

impl EventBus {
    /// Create a new event bus
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AvdeccEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: AvdeccEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    /// Get subscriber count
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
pub struct EventFilter {
    rx: broadcast::Receiver<AvdeccEvent>,
    filter: Box<dyn Fn(&AvdeccEvent) -> bool + Send>,
}

impl EventFilter {
    /// Create a filtered event receiver
    pub fn new<F>(bus: &EventBus, filter: F) -> Self
    where
        F: Fn(&AvdeccEvent) -> bool + Send + 'static,
    {
        Self {
            rx: bus.subscribe(),
            filter: Box::new(filter),
        }
    }

    /// Receive next matching event
    pub async fn recv(&mut self) -> Option<AvdeccEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if (self.filter)(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Helper functions for common filters
impl EventFilter {
    /// Entity arrivals, updates and departures
    #[must_use]
    pub fn discovery_events(bus: &EventBus) -> Self {
        Self::new(bus, |e| {
            matches!(
                e,
                AvdeccEvent::EntityAvailable { .. }
                    | AvdeccEvent::EntityUpdated { .. }
                    | AvdeccEvent::EntityDeparted { .. }
            )
        })
    }

    /// Stream connection changes
    #[must_use]
    pub fn connection_events(bus: &EventBus) -> Self {
        Self::new(bus, |e| matches!(e, AvdeccEvent::ConnectionChanged { .. }))
    }

    /// Everything concerning one remote entity
    #[must_use]
    pub fn entity_events(bus: &EventBus, entity_id: EntityId) -> Self {
        Self::new(bus, move |e| match e {
            AvdeccEvent::EntityAvailable { entity } | AvdeccEvent::EntityUpdated { entity } => {
                entity.entity_id() == entity_id
            }
            AvdeccEvent::EntityDeparted { entity_id: id, .. }
            | AvdeccEvent::GrandmasterChanged { entity_id: id, .. }
            | AvdeccEvent::UnsolicitedResponse { entity_id: id, .. } => *id == entity_id,
            AvdeccEvent::ConnectionChanged { connection } => {
                connection.talker_entity_id == entity_id
                    || connection.listener_entity_id == entity_id
            }
            _ => false,
        })
    }
}
