//! Requests from application handles to the runner

use crate::engine::{Reply, StreamConnection};
use crate::protocol::acmp::AcmpPdu;
use crate::protocol::aecp::AecpPdu;
use crate::protocol::aem::{Descriptor, DescriptorRef};
use crate::types::{EntityId, RemoteEntity};

/// One application request, answered through its `reply` channel
#[derive(Debug)]
pub(crate) enum Request {
    /// Snapshot of the directory
    Entities { reply: Reply<Vec<RemoteEntity>> },
    /// One directory entry
    Entity {
        entity_id: EntityId,
        reply: Reply<Option<RemoteEntity>>,
    },
    /// Send ENTITY_DISCOVER, global when `entity_id` is zero
    Discover {
        entity_id: EntityId,
        reply: Reply<()>,
    },
    /// Descriptor from the directory cache, without network traffic
    CachedDescriptor {
        entity_id: EntityId,
        descriptor: DescriptorRef,
        reply: Reply<Option<Descriptor>>,
    },
    /// AECP command to a remote entity
    Aecp {
        command: AecpPdu,
        reply: Reply<AecpPdu>,
    },
    /// ACMP controller command
    Acmp {
        command: AcmpPdu,
        reply: Reply<AcmpPdu>,
    },
    /// Connections known to the controller role
    Connections { reply: Reply<Vec<StreamConnection>> },
}
