//! Test doubles and fixtures for exercising stacks without hardware

mod network;
mod streaming;


pub use network::{NetworkConditions, VirtualNetwork, VirtualPort};
pub use streaming::{RecordingStreaming, StreamingFaults, StreamingLog};

use std::time::Duration;

use crate::types::{
    AvdeccConfig, ControlConfig, ListenerStreamConfig, MacAddress, TalkerStreamConfig,
};

/// Locally administered MAC ending in `n`
#[must_use]
pub fn test_mac(n: u8) -> MacAddress {
    MacAddress([0x02, 0x00, 0x5E, 0x10, 0x00, n])
}

fn base_config(n: u8, name: &str) -> AvdeccConfig {
    AvdeccConfig::builder()
        .mac_address(test_mac(n))
        .entity_name(name)
        .entity_model_id(0x001B_92FF_FE00_0000 | u64::from(n))
        .available_index(1)
        .valid_time(Duration::from_secs(10))
        .build()
}

/// Entity with two talker streams and an IDENTIFY control
#[must_use]
pub fn talker_config(n: u8) -> AvdeccConfig {
    let mut config = base_config(n, "Talker");
    config.entity.controller = false;
    config.entity.talker_streams = vec![
        TalkerStreamConfig {
            name: String::from("Main out"),
            ..TalkerStreamConfig::default()
        },
        TalkerStreamConfig {
            name: String::from("Aux out"),
            max_listeners: 1,
            ..TalkerStreamConfig::default()
        },
    ];
    config.entity.controls = vec![ControlConfig::default()];
    config
}

/// Entity with two listener streams
#[must_use]
pub fn listener_config(n: u8) -> AvdeccConfig {
    let mut config = base_config(n, "Listener");
    config.entity.controller = false;
    config.entity.listener_streams = vec![
        ListenerStreamConfig {
            name: String::from("Main in"),
            ..ListenerStreamConfig::default()
        },
        ListenerStreamConfig {
            name: String::from("Aux in"),
            ..ListenerStreamConfig::default()
        },
    ];
    config
}

/// Controller without streams
#[must_use]
pub fn controller_config(n: u8) -> AvdeccConfig {
    let mut config = base_config(n, "Controller");
    config.entity.controller = true;
    config
}
