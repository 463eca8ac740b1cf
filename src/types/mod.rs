//! Core types module

mod config;
mod entity;
mod ids;


pub use config::{
    AvdeccConfig, AvdeccConfigBuilder, ControlConfig, EntityConfig, ListenerStreamConfig,
    TalkerStreamConfig,
};
pub use entity::{
    ControllerCapabilities, EntityCapabilities, EntityInfo, ListenerCapabilities, RemoteEntity,
    TalkerCapabilities,
};
pub use ids::{EntityId, MacAddress, ParseMacError, StreamId};
