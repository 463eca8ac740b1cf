//! Table of known remote entities and their descriptor cache.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::protocol::aem::{Descriptor, DescriptorRef};
use crate::types::{EntityId, EntityInfo, MacAddress, RemoteEntity};


/// Result of recording an advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First advertisement from this entity
    Added,
    /// Known entity re-advertised
    Updated {
        /// The advertised gPTP grandmaster differs from the previous one
        grandmaster_changed: bool,
        /// Some advertised field other than liveness changed
        info_changed: bool,
    },
    /// `available_index` did not advance: the entity rebooted and its
    /// cached state was discarded
    Restarted {
        /// Entry as it was before the restart
        previous: RemoteEntity,
    },
    /// Directory full, advertisement ignored
    Rejected,
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    entity: RemoteEntity,
    descriptors: HashMap<DescriptorRef, Descriptor>,
}

/// Directory of remote entities learned from ADP
#[derive(Debug, Clone)]
pub struct EntityDirectory {
    capacity: usize,
    entries: HashMap<EntityId, DirectoryEntry>,
}

impl EntityDirectory {
    /// Create a directory holding at most `capacity` entities
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Number of known entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entity is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `entity_id` is known
    #[must_use]
    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.entries.contains_key(&entity_id)
    }

    /// Look up one entity
    #[must_use]
    pub fn get(&self, entity_id: EntityId) -> Option<&RemoteEntity> {
        self.entries.get(&entity_id).map(|e| &e.entity)
    }

    /// MAC address an entity was last seen from
    #[must_use]
    pub fn mac_address(&self, entity_id: EntityId) -> Option<MacAddress> {
        self.get(entity_id).map(|e| e.mac_address)
    }

    /// Snapshot of all entities, ordered by entity id
    #[must_use]
    pub fn entities(&self) -> Vec<RemoteEntity> {
        let mut out: Vec<_> = self.entries.values().map(|e| e.entity.clone()).collect();
        out.sort_by_key(RemoteEntity::entity_id);
        out
    }

    /// Record an ENTITY_AVAILABLE advertisement
    pub fn upsert(
        &mut self,
        info: EntityInfo,
        mac_address: MacAddress,
        port: u16,
        now: Instant,
    ) -> UpsertOutcome {
        let entity_id = info.entity_id;
        let fresh = RemoteEntity {
            info,
            mac_address,
            port,
            last_seen: now,
        };

        let Some(entry) = self.entries.get_mut(&entity_id) else {
            if self.entries.len() >= self.capacity {
                warn!(%entity_id, capacity = self.capacity, "entity directory full");
                return UpsertOutcome::Rejected;
            }
            info!(%entity_id, %mac_address, "entity available");
            self.entries.insert(
                entity_id,
                DirectoryEntry {
                    entity: fresh,
                    descriptors: HashMap::new(),
                },
            );
            return UpsertOutcome::Added;
        };

        let previous = &entry.entity;
        if restarted(previous.info.available_index, fresh.info.available_index) {
            warn!(
                %entity_id,
                previous = previous.info.available_index,
                current = fresh.info.available_index,
                "entity restarted"
            );
            let previous = std::mem::replace(&mut entry.entity, fresh);
            entry.descriptors.clear();
            return UpsertOutcome::Restarted { previous };
        }

        let grandmaster_changed = previous.info.gptp_grandmaster_id
            != fresh.info.gptp_grandmaster_id
            || previous.info.gptp_domain_number != fresh.info.gptp_domain_number;
        let info_changed = {
            let mut old = previous.info.clone();
            old.available_index = fresh.info.available_index;
            old != fresh.info || previous.mac_address != fresh.mac_address
        };
        debug!(%entity_id, available_index = fresh.info.available_index, "entity refreshed");
        entry.entity = fresh;
        UpsertOutcome::Updated {
            grandmaster_changed,
            info_changed,
        }
    }

    /// Remove an entity, for example on ENTITY_DEPARTING
    pub fn remove(&mut self, entity_id: EntityId) -> Option<RemoteEntity> {
        let entry = self.entries.remove(&entity_id)?;
        info!(%entity_id, "entity removed");
        Some(entry.entity)
    }

    /// Remove every entity whose validity expired at `now`
    pub fn sweep(&mut self, now: Instant) -> Vec<RemoteEntity> {
        let expired: Vec<EntityId> = self
            .entries
            .values()
            .filter(|e| now >= e.entity.expires_at())
            .map(|e| e.entity.entity_id())
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for entity_id in expired {
            if let Some(entry) = self.entries.remove(&entity_id) {
                info!(%entity_id, "entity timed out");
                out.push(entry.entity);
            }
        }
        out
    }

    /// Earliest expiry among known entities
    #[must_use]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.entity.expires_at()).min()
    }

    /// Cache a descriptor read from `entity_id`. Ignored for unknown
    /// entities.
    pub fn cache_descriptor(&mut self, entity_id: EntityId, descriptor: Descriptor) -> bool {
        let Some(entry) = self.entries.get_mut(&entity_id) else {
            return false;
        };
        entry.descriptors.insert(descriptor.reference(), descriptor);
        true
    }

    /// Cached descriptor, if any
    #[must_use]
    pub fn cached_descriptor(
        &self,
        entity_id: EntityId,
        descriptor: DescriptorRef,
    ) -> Option<&Descriptor> {
        self.entries
            .get(&entity_id)
            .and_then(|e| e.descriptors.get(&descriptor))
    }

    /// Number of descriptors cached for an entity
    #[must_use]
    pub fn cached_descriptor_count(&self, entity_id: EntityId) -> usize {
        self.entries
            .get(&entity_id)
            .map_or(0, |e| e.descriptors.len())
    }
}

/// Whether `current` fails to advance past `previous`, modulo 2^32.
///
/// Entities bump available_index on every advertisement, so a repeated or
/// older value means the counter started over.
fn restarted(previous: u32, current: u32) -> bool {
    let delta = current.wrapping_sub(previous);
    delta == 0 || delta >= 1 << 31
}
