mod adp;
mod pdu_proptest;

use std::time::Duration;

use crate::types::{
    ControllerCapabilities, EntityCapabilities, EntityId, EntityInfo, ListenerCapabilities,
    TalkerCapabilities,
};

fn sample_info() -> EntityInfo {
    EntityInfo {
        entity_id: EntityId(0x0011_22ff_fe33_4455),
        entity_model_id: 0x0001_0203_0405_0607,
        entity_capabilities: EntityCapabilities::AEM_SUPPORTED
            | EntityCapabilities::CLASS_A_SUPPORTED
            | EntityCapabilities::GPTP_SUPPORTED,
        talker_stream_sources: 2,
        talker_capabilities: TalkerCapabilities::IMPLEMENTED | TalkerCapabilities::AUDIO_SOURCE,
        listener_stream_sinks: 1,
        listener_capabilities: ListenerCapabilities::IMPLEMENTED | ListenerCapabilities::AUDIO_SINK,
        controller_capabilities: ControllerCapabilities::NONE,
        available_index: 5,
        gptp_grandmaster_id: 0xaabb_ccff_fedd_eeff,
        gptp_domain_number: 0,
        identify_control_index: 0,
        interface_index: 0,
        association_id: 0,
        valid_time: Duration::from_secs(10),
    }
}
