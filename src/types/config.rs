use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::{EntityId, MacAddress};
use crate::error::{AvdeccError, Result};

/// Serialize a `Duration` as whole milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }
}

/// A talker stream (STREAM_OUTPUT) of the local entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkerStreamConfig {
    /// Object name
    pub name: String,
    /// AVTP stream format
    pub format: u64,
    /// Further formats SET_STREAM_FORMAT may select
    pub alternate_formats: Vec<u64>,
    /// VLAN the stream is sent on
    pub vlan_id: u16,
    /// Fixed destination MAC, allocated from the stream pool when absent
    pub dest_mac: Option<MacAddress>,
    /// Maximum number of simultaneous listeners, 0 for unlimited
    pub max_listeners: u16,
    /// Only one listener may connect
    pub exclusive: bool,
    /// SR class B instead of class A
    pub class_b: bool,
}

impl Default for TalkerStreamConfig {
    fn default() -> Self {
        Self {
            name: String::from("Output"),
            format: 0x0205_0220_0040_6000,
            alternate_formats: Vec::new(),
            vlan_id: 2,
            dest_mac: None,
            max_listeners: 0,
            exclusive: false,
            class_b: false,
        }
    }
}

/// A listener stream (STREAM_INPUT) of the local entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerStreamConfig {
    /// Object name
    pub name: String,
    /// AVTP stream format
    pub format: u64,
    /// Further formats SET_STREAM_FORMAT may select
    pub alternate_formats: Vec<u64>,
}

impl Default for ListenerStreamConfig {
    fn default() -> Self {
        Self {
            name: String::from("Input"),
            format: 0x0205_0220_0040_6000,
            alternate_formats: Vec::new(),
        }
    }
}

/// A CONTROL descriptor with a single linear `u8` value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Object name
    pub name: String,
    /// Control type (EUI-64)
    pub control_type: u64,
    /// Minimum value
    pub min: u8,
    /// Maximum value
    pub max: u8,
    /// Step between valid values
    pub step: u8,
    /// Value at boot
    pub default: u8,
    /// Value cannot be changed by SET_CONTROL
    pub read_only: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            name: String::from("Identify"),
            control_type: 0x90E0_F000_0000_0001,
            min: 0,
            max: 255,
            step: 255,
            default: 0,
            read_only: false,
        }
    }
}

/// Description of the local entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Entity id, derived from the interface MAC when unset
    pub entity_id: EntityId,
    /// Entity model id
    pub entity_model_id: u64,
    /// Entity name
    pub entity_name: String,
    /// Firmware version string
    pub firmware_version: String,
    /// Group name
    pub group_name: String,
    /// Serial number string
    pub serial_number: String,
    /// available_index of the first advertisement; advances by one per
    /// ENTITY_AVAILABLE sent
    pub available_index: u32,
    /// Entity also acts as a controller
    pub controller: bool,
    /// Association id, if any
    pub association_id: Option<u64>,
    /// Talker streams
    pub talker_streams: Vec<TalkerStreamConfig>,
    /// Listener streams
    pub listener_streams: Vec<ListenerStreamConfig>,
    /// Controls
    pub controls: Vec<ControlConfig>,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            entity_id: EntityId::NONE,
            entity_model_id: 0,
            entity_name: String::from("avdecc-rs"),
            firmware_version: String::from(env!("CARGO_PKG_VERSION")),
            group_name: String::new(),
            serial_number: String::new(),
            available_index: 0,
            controller: true,
            association_id: None,
            talker_streams: Vec::new(),
            listener_streams: Vec::new(),
            controls: Vec::new(),
        }
    }
}

/// Configuration of one AVDECC control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvdeccConfig {
    /// Local entity
    pub entity: EntityConfig,

    /// Logical network port (default: 0)
    pub port: u16,

    /// MAC address of the network interface
    pub mac_address: MacAddress,

    /// Advertisement validity, 2 to 62 seconds (default: 62 seconds)
    #[serde(with = "duration_ms")]
    pub valid_time: Duration,

    /// Re-advertisement period (default: half of `valid_time`)
    #[serde(with = "duration_ms::option")]
    pub advertise_interval: Option<Duration>,

    /// Entity directory capacity (default: 256)
    pub max_entities: usize,

    /// Outstanding commands per protocol (default: 32)
    pub max_inflight: usize,

    /// AECP command timeout (default: 250ms)
    #[serde(with = "duration_ms")]
    pub aecp_timeout: Duration,

    /// AECP retries after the first attempt (default: 2)
    pub aecp_retries: u8,

    /// ACMP retries after the first attempt (default: 2)
    pub acmp_retries: u8,

    /// Lock expiry when not refreshed by its owner (default: 60 seconds)
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,

    /// Timer resolution of the runner (default: 10ms)
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,

    /// Behave as a Milan entity
    pub milan_mode: bool,
}

impl Default for AvdeccConfig {
    fn default() -> Self {
        Self {
            entity: EntityConfig::default(),
            port: 0,
            mac_address: MacAddress::ZERO,
            valid_time: Duration::from_secs(62),
            advertise_interval: None,
            max_entities: 256,
            max_inflight: 32,
            aecp_timeout: Duration::from_millis(250),
            aecp_retries: 2,
            acmp_retries: 2,
            lock_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_millis(10),
            milan_mode: false,
        }
    }
}

impl AvdeccConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> AvdeccConfigBuilder {
        AvdeccConfigBuilder::default()
    }

    /// Parse a JSON configuration and validate it
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::Config` if the document is malformed or invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| AvdeccError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a configuration
    /// error if it does not parse or validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize to pretty JSON
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::Config` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| AvdeccError::Config {
            message: e.to_string(),
        })
    }

    /// Check ranges and consistency
    ///
    /// # Errors
    ///
    /// Returns `AvdeccError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(AvdeccError::Config { message });

        if !(2..=62).contains(&self.valid_time.as_secs()) {
            return fail(format!(
                "valid_time must be between 2 and 62 seconds, got {:?}",
                self.valid_time
            ));
        }
        if let Some(interval) = self.advertise_interval {
            if interval.is_zero() || interval >= self.valid_time {
                return fail(format!(
                    "advertise_interval {interval:?} must be non-zero and shorter than valid_time"
                ));
            }
        }
        if self.max_entities == 0 {
            return fail("max_entities must be at least 1".to_string());
        }
        if self.max_inflight == 0 || self.max_inflight > 4096 {
            return fail(format!(
                "max_inflight must be between 1 and 4096, got {}",
                self.max_inflight
            ));
        }
        if self.aecp_timeout.is_zero() || self.tick_interval.is_zero() {
            return fail("timeouts must be non-zero".to_string());
        }
        if !self.entity_id().is_valid() {
            return fail("entity_id is unset and no mac_address to derive it from".to_string());
        }
        if self.entity.talker_streams.len() > usize::from(u16::MAX)
            || self.entity.listener_streams.len() > usize::from(u16::MAX)
        {
            return fail("too many streams".to_string());
        }
        for control in &self.entity.controls {
            if control.min > control.max
                || control.step == 0
                || !(control.min..=control.max).contains(&control.default)
            {
                return fail(format!("control '{}' has an invalid range", control.name));
            }
        }
        Ok(())
    }

    /// Entity id in use, derived as EUI-64 from the MAC when not configured
    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        if self.entity.entity_id.is_valid() || self.mac_address == MacAddress::ZERO {
            return self.entity.entity_id;
        }
        let m = self.mac_address.0;
        EntityId(u64::from_be_bytes([
            m[0], m[1], m[2], 0xFF, 0xFE, m[3], m[4], m[5],
        ]))
    }

    /// Effective re-advertisement period
    #[must_use]
    pub fn advertise_interval(&self) -> Duration {
        self.advertise_interval.unwrap_or(self.valid_time / 2)
    }
}

/// Builder for `AvdeccConfig`
#[derive(Debug, Clone, Default)]
pub struct AvdeccConfigBuilder {
    config: AvdeccConfig,
}

impl AvdeccConfigBuilder {
    /// Set the local entity id
    #[must_use]
    pub fn entity_id(mut self, id: impl Into<EntityId>) -> Self {
        self.config.entity.entity_id = id.into();
        self
    }

    /// Set the entity model id
    #[must_use]
    pub fn entity_model_id(mut self, id: u64) -> Self {
        self.config.entity.entity_model_id = id;
        self
    }

    /// Set the entity name
    #[must_use]
    pub fn entity_name(mut self, name: impl Into<String>) -> Self {
        self.config.entity.entity_name = name.into();
        self
    }

    /// Set the `available_index` of the first advertisement
    #[must_use]
    pub fn available_index(mut self, index: u32) -> Self {
        self.config.entity.available_index = index;
        self
    }

    /// Enable or disable the controller role
    #[must_use]
    pub fn controller(mut self, enable: bool) -> Self {
        self.config.entity.controller = enable;
        self
    }

    /// Add a talker stream
    #[must_use]
    pub fn talker_stream(mut self, stream: TalkerStreamConfig) -> Self {
        self.config.entity.talker_streams.push(stream);
        self
    }

    /// Add a listener stream
    #[must_use]
    pub fn listener_stream(mut self, stream: ListenerStreamConfig) -> Self {
        self.config.entity.listener_streams.push(stream);
        self
    }

    /// Add a control
    #[must_use]
    pub fn control(mut self, control: ControlConfig) -> Self {
        self.config.entity.controls.push(control);
        self
    }

    /// Set the logical port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the interface MAC address
    #[must_use]
    pub fn mac_address(mut self, mac: MacAddress) -> Self {
        self.config.mac_address = mac;
        self
    }

    /// Set the advertisement validity
    #[must_use]
    pub fn valid_time(mut self, valid_time: Duration) -> Self {
        self.config.valid_time = valid_time;
        self
    }

    /// Set the re-advertisement period
    #[must_use]
    pub fn advertise_interval(mut self, interval: Duration) -> Self {
        self.config.advertise_interval = Some(interval);
        self
    }

    /// Set the entity directory capacity
    #[must_use]
    pub fn max_entities(mut self, max: usize) -> Self {
        self.config.max_entities = max;
        self
    }

    /// Set the number of outstanding commands per protocol
    #[must_use]
    pub fn max_inflight(mut self, max: usize) -> Self {
        self.config.max_inflight = max;
        self
    }

    /// Set the AECP timeout
    #[must_use]
    pub fn aecp_timeout(mut self, timeout: Duration) -> Self {
        self.config.aecp_timeout = timeout;
        self
    }

    /// Set the AECP retry count
    #[must_use]
    pub fn aecp_retries(mut self, retries: u8) -> Self {
        self.config.aecp_retries = retries;
        self
    }

    /// Set the ACMP retry count
    #[must_use]
    pub fn acmp_retries(mut self, retries: u8) -> Self {
        self.config.acmp_retries = retries;
        self
    }

    /// Set the lock expiry
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the runner tick interval
    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Enable Milan behaviour
    #[must_use]
    pub fn milan_mode(mut self, enable: bool) -> Self {
        self.config.milan_mode = enable;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> AvdeccConfig {
        self.config
    }
}
