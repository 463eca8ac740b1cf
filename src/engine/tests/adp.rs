use std::time::{Duration, Instant};

use super::VALID_TIME;
use crate::directory::EntityDirectory;
use crate::engine::{AdpEngine, AdpOutcome, AdvertiseDue, LocalEntity};
use crate::net::GptpInfo;
use crate::protocol::adp::{AdpMessageType, AdpPdu};
use crate::testing::{listener_config, talker_config, test_mac};
use crate::types::{EntityId, EntityInfo};

const INTERVAL: Duration = Duration::from_secs(5);

fn local() -> LocalEntity {
    LocalEntity::new(&talker_config(1))
}

fn engine() -> AdpEngine {
    AdpEngine::new(local().entity_id(), VALID_TIME, INTERVAL)
}

fn remote_info(n: u8) -> EntityInfo {
    LocalEntity::new(&listener_config(n)).info(GptpInfo::default(), VALID_TIME)
}

fn available(info: EntityInfo) -> AdpPdu {
    AdpPdu {
        message_type: AdpMessageType::EntityAvailable,
        info,
    }
}

#[test]
fn test_advertises_on_start_then_periodically() {
    let mut adp = engine();
    let now = Instant::now();
    let gptp = GptpInfo::default();

    assert!(adp.poll(now, gptp).is_none());
    adp.start(now);
    assert!(adp.is_running());
    assert_eq!(
        adp.poll(now, gptp),
        Some(AdvertiseDue {
            grandmaster_changed: false
        })
    );
    assert!(adp.poll(now + Duration::from_secs(1), gptp).is_none());
    assert!(adp.poll(now + INTERVAL, gptp).is_some());
    assert_eq!(adp.next_deadline(), Some(now + INTERVAL * 2));

    adp.stop();
    assert!(adp.poll(now + INTERVAL * 3, gptp).is_none());
}

#[test]
fn test_grandmaster_change_readvertises_immediately() {
    let mut adp = engine();
    let now = Instant::now();
    adp.start(now);
    adp.poll(now, GptpInfo::default());

    let later = now + Duration::from_secs(1);
    let new_gm = GptpInfo {
        grandmaster_id: 0x0011_22FF_FE33_4455,
        domain_number: 0,
    };
    assert_eq!(
        adp.poll(later, new_gm),
        Some(AdvertiseDue {
            grandmaster_changed: true
        })
    );
    assert_eq!(adp.next_deadline(), Some(later + INTERVAL));
    assert!(adp.poll(later, new_gm).is_none());
}

#[test]
fn test_discover_schedules_advertisement_within_bound() {
    let mut adp = engine();
    let mut directory = EntityDirectory::new(8);
    let now = Instant::now();
    adp.start(now);
    adp.poll(now, GptpInfo::default());

    let at = now + Duration::from_secs(1);
    let outcome = adp.handle_pdu(
        &AdpPdu::discover(EntityId::NONE),
        test_mac(9),
        0,
        at,
        &mut directory,
    );

    assert_eq!(outcome, AdpOutcome::DiscoverScheduled);
    let deadline = adp.next_deadline().unwrap();
    assert!(deadline >= at);
    assert!(deadline <= at + VALID_TIME / 5);
    assert!(directory.is_empty());
}

#[test]
fn test_discover_for_other_entity_ignored() {
    let mut adp = engine();
    let mut directory = EntityDirectory::new(8);
    let now = Instant::now();
    adp.start(now);
    adp.poll(now, GptpInfo::default());

    let outcome = adp.handle_pdu(
        &AdpPdu::discover(EntityId(0x1234)),
        test_mac(9),
        0,
        now,
        &mut directory,
    );
    assert_eq!(outcome, AdpOutcome::Ignored);
    assert_eq!(adp.next_deadline(), Some(now + INTERVAL));

    let targeted = adp.handle_pdu(
        &AdpPdu::discover(local().entity_id()),
        test_mac(9),
        0,
        now,
        &mut directory,
    );
    assert_eq!(targeted, AdpOutcome::DiscoverScheduled);
}

#[test]
fn test_discover_ignored_when_not_advertising() {
    let mut adp = engine();
    let mut directory = EntityDirectory::new(8);
    let outcome = adp.handle_pdu(
        &AdpPdu::discover(EntityId::NONE),
        test_mac(9),
        0,
        Instant::now(),
        &mut directory,
    );
    assert_eq!(outcome, AdpOutcome::Ignored);
}

#[test]
fn test_remote_lifecycle() {
    let mut adp = engine();
    let mut directory = EntityDirectory::new(8);
    let now = Instant::now();
    let mut info = remote_info(2);
    info.available_index = 5;

    let outcome = adp.handle_pdu(&available(info.clone()), test_mac(2), 0, now, &mut directory);
    assert!(matches!(outcome, AdpOutcome::Discovered(ref e) if e.entity_id() == info.entity_id));

    let later = now + Duration::from_secs(2);
    info.available_index = 6;
    let outcome = adp.handle_pdu(&available(info.clone()), test_mac(2), 0, later, &mut directory);
    assert!(matches!(
        outcome,
        AdpOutcome::Refreshed {
            info_changed: false,
            grandmaster_changed: false,
            ..
        }
    ));
    assert_eq!(
        directory.get(info.entity_id).unwrap().expires_at(),
        later + VALID_TIME
    );

    let mut rebooted = info.clone();
    rebooted.available_index = 0;
    let outcome = adp.handle_pdu(&available(rebooted), test_mac(2), 0, later, &mut directory);
    assert!(matches!(
        outcome,
        AdpOutcome::Restarted { ref previous, ref entity }
            if previous.info.available_index == 6 && entity.info.available_index == 0
    ));

    let departing = AdpPdu {
        message_type: AdpMessageType::EntityDeparting,
        info: info.clone(),
    };
    let outcome = adp.handle_pdu(&departing, test_mac(2), 0, later, &mut directory);
    assert!(matches!(outcome, AdpOutcome::Departed(_)));
    assert!(directory.is_empty());

    let outcome = adp.handle_pdu(&departing, test_mac(2), 0, later, &mut directory);
    assert_eq!(outcome, AdpOutcome::Ignored);
}

#[test]
fn test_grandmaster_change_in_advertisement() {
    let mut adp = engine();
    let mut directory = EntityDirectory::new(8);
    let now = Instant::now();
    let info = remote_info(2);
    adp.handle_pdu(&available(info.clone()), test_mac(2), 0, now, &mut directory);

    let mut moved = info;
    moved.available_index += 1;
    moved.gptp_grandmaster_id = 0xAA;
    let outcome = adp.handle_pdu(&available(moved), test_mac(2), 0, now, &mut directory);
    assert!(matches!(
        outcome,
        AdpOutcome::Refreshed {
            grandmaster_changed: true,
            ..
        }
    ));
}

#[test]
fn test_own_and_invalid_advertisements_ignored() {
    let mut adp = engine();
    let mut directory = EntityDirectory::new(8);
    let now = Instant::now();

    let own = local().info(GptpInfo::default(), VALID_TIME);
    let outcome = adp.handle_pdu(&available(own), test_mac(1), 0, now, &mut directory);
    assert_eq!(outcome, AdpOutcome::Ignored);

    let mut nobody = remote_info(2);
    nobody.entity_id = EntityId::NONE;
    let outcome = adp.handle_pdu(&available(nobody), test_mac(2), 0, now, &mut directory);
    assert_eq!(outcome, AdpOutcome::Ignored);
    assert!(directory.is_empty());
}

#[test]
fn test_directory_full_rejects() {
    let mut adp = engine();
    let mut directory = EntityDirectory::new(1);
    let now = Instant::now();

    adp.handle_pdu(&available(remote_info(2)), test_mac(2), 0, now, &mut directory);
    let outcome = adp.handle_pdu(&available(remote_info(3)), test_mac(3), 0, now, &mut directory);
    assert_eq!(outcome, AdpOutcome::Rejected);
    assert_eq!(directory.len(), 1);
}

#[test]
fn test_departing_pdu_carries_local_info() {
    let adp = engine();
    let entity = local();
    let pdu = adp.departing(&entity, GptpInfo::default());
    assert_eq!(pdu.message_type, AdpMessageType::EntityDeparting);
    assert_eq!(pdu.info, entity.info(GptpInfo::default(), VALID_TIME));
}

#[test]
fn test_each_advertisement_advances_available_index() {
    let adp = engine();
    let mut config = talker_config(1);
    config.entity.available_index = u32::MAX;
    let mut entity = LocalEntity::new(&config);
    let gptp = GptpInfo::default();

    let first = adp.advertisement(&mut entity, gptp);
    assert_eq!(first.message_type, AdpMessageType::EntityAvailable);
    assert_eq!(first.info.available_index, u32::MAX);
    assert_eq!(adp.advertisement(&mut entity, gptp).info.available_index, 0);
    assert_eq!(adp.advertisement(&mut entity, gptp).info.available_index, 1);

    // Departing reports the current value without consuming one
    assert_eq!(adp.departing(&entity, gptp).info.available_index, 2);
    assert_eq!(entity.available_index(), 2);
}
