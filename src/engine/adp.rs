//! ADP engine: local advertisement and remote liveness

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace};

use super::entity_model::LocalEntity;
use crate::directory::{EntityDirectory, UpsertOutcome};
use crate::net::GptpInfo;
use crate::protocol::adp::{AdpMessageType, AdpPdu};
use crate::types::{EntityId, MacAddress, RemoteEntity};

/// What an inbound ADP PDU did to the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdpOutcome {
    /// Nothing changed
    Ignored,
    /// New entity
    Discovered(RemoteEntity),
    /// Known entity re-advertised
    Refreshed {
        /// Entry after the update
        entity: RemoteEntity,
        /// Advertised fields other than liveness differ
        info_changed: bool,
        /// Grandmaster or domain differs
        grandmaster_changed: bool,
    },
    /// Known entity restarted; caches were dropped
    Restarted {
        /// Entry before the restart
        previous: RemoteEntity,
        /// Fresh entry
        entity: RemoteEntity,
    },
    /// Entity sent ENTITY_DEPARTING
    Departed(RemoteEntity),
    /// Directory full
    Rejected,
    /// A DISCOVER asked for our advertisement
    DiscoverScheduled,
}

/// Advertisement due, reported by [`AdpEngine::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseDue {
    /// Sent early because the local grandmaster changed
    pub grandmaster_changed: bool,
}

/// Discovery state machine of one entity
#[derive(Debug, Clone)]
pub struct AdpEngine {
    local_id: EntityId,
    valid_time: Duration,
    interval: Duration,
    next_advertisement: Option<Instant>,
    advertised_gptp: Option<GptpInfo>,
}

impl AdpEngine {
    /// Engine advertising `local_id` every `interval`, valid for `valid_time`
    #[must_use]
    pub fn new(local_id: EntityId, valid_time: Duration, interval: Duration) -> Self {
        Self {
            local_id,
            valid_time,
            interval,
            next_advertisement: None,
            advertised_gptp: None,
        }
    }

    /// Start advertising; the first advertisement is due immediately
    pub fn start(&mut self, now: Instant) {
        self.next_advertisement = Some(now);
    }

    /// Stop advertising
    pub fn stop(&mut self) {
        self.next_advertisement = None;
    }

    /// Whether advertisements are being sent
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.next_advertisement.is_some()
    }

    /// When the next advertisement is due
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_advertisement
    }

    /// Check whether an advertisement must be sent now.
    ///
    /// A grandmaster change makes it due immediately.
    pub fn poll(&mut self, now: Instant, gptp: GptpInfo) -> Option<AdvertiseDue> {
        let deadline = self.next_advertisement?;
        let grandmaster_changed = self.advertised_gptp.is_some_and(|g| g != gptp);
        if now < deadline && !grandmaster_changed {
            return None;
        }
        self.advertised_gptp = Some(gptp);
        self.next_advertisement = Some(now + self.interval);
        Some(AdvertiseDue {
            grandmaster_changed,
        })
    }

    /// ENTITY_AVAILABLE for the local entity; advances its available_index
    pub fn advertisement(&self, entity: &mut LocalEntity, gptp: GptpInfo) -> AdpPdu {
        let pdu = AdpPdu {
            message_type: AdpMessageType::EntityAvailable,
            info: entity.info(gptp, self.valid_time),
        };
        entity.advance_available_index();
        pdu
    }

    /// ENTITY_DEPARTING for the local entity
    #[must_use]
    pub fn departing(&self, entity: &LocalEntity, gptp: GptpInfo) -> AdpPdu {
        AdpPdu {
            message_type: AdpMessageType::EntityDeparting,
            info: entity.info(gptp, self.valid_time),
        }
    }

    /// Process one inbound ADP PDU
    pub fn handle_pdu(
        &mut self,
        pdu: &AdpPdu,
        source: MacAddress,
        port: u16,
        now: Instant,
        directory: &mut EntityDirectory,
    ) -> AdpOutcome {
        let entity_id = pdu.info.entity_id;
        trace!(%entity_id, message_type = %pdu.message_type, "ADP received");

        match pdu.message_type {
            AdpMessageType::EntityDiscover => {
                if entity_id != EntityId::NONE && entity_id != self.local_id {
                    return AdpOutcome::Ignored;
                }
                let Some(scheduled) = self.next_advertisement else {
                    return AdpOutcome::Ignored;
                };
                let max_delay = u64::try_from((self.valid_time / 5).as_millis()).unwrap_or(0);
                let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max_delay));
                self.next_advertisement = Some(scheduled.min(now + delay));
                debug!(?delay, "discover received, advertisement scheduled");
                AdpOutcome::DiscoverScheduled
            }
            _ if entity_id == self.local_id || !entity_id.is_valid() => AdpOutcome::Ignored,
            AdpMessageType::EntityAvailable => {
                match directory.upsert(pdu.info.clone(), source, port, now) {
                    UpsertOutcome::Added => directory
                        .get(entity_id)
                        .cloned()
                        .map_or(AdpOutcome::Ignored, AdpOutcome::Discovered),
                    UpsertOutcome::Updated {
                        grandmaster_changed,
                        info_changed,
                    } => directory
                        .get(entity_id)
                        .cloned()
                        .map_or(AdpOutcome::Ignored, |entity| AdpOutcome::Refreshed {
                            entity,
                            info_changed,
                            grandmaster_changed,
                        }),
                    UpsertOutcome::Restarted { previous } => directory
                        .get(entity_id)
                        .cloned()
                        .map_or(AdpOutcome::Ignored, |entity| AdpOutcome::Restarted {
                            previous,
                            entity,
                        }),
                    UpsertOutcome::Rejected => AdpOutcome::Rejected,
                }
            }
            AdpMessageType::EntityDeparting => directory
                .remove(entity_id)
                .map_or(AdpOutcome::Ignored, AdpOutcome::Departed),
        }
    }
}
