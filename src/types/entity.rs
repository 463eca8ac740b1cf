//! Entity capability flags and advertised entity information

use std::time::{Duration, Instant};

use super::ids::{EntityId, MacAddress};

macro_rules! capability_flags {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            /// No flag set
            pub const NONE: Self = Self(0);

            /// All bits of `other` are set in `self`
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Raw value
            #[must_use]
            pub const fn bits(self) -> $repr {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

capability_flags! {
    /// ADP entity capabilities
    EntityCapabilities(u32) {
        /// Entity firmware update mode
        EFU_MODE = 1 << 0;
        /// Address access commands supported
        ADDRESS_ACCESS_SUPPORTED = 1 << 1;
        /// Gateway entity
        GATEWAY_ENTITY = 1 << 2;
        /// AEM supported
        AEM_SUPPORTED = 1 << 3;
        /// Legacy AV/C
        LEGACY_AVC = 1 << 4;
        /// Association id supported
        ASSOCIATION_ID_SUPPORTED = 1 << 5;
        /// Association id field valid
        ASSOCIATION_ID_VALID = 1 << 6;
        /// Vendor unique commands supported
        VENDOR_UNIQUE_SUPPORTED = 1 << 7;
        /// Class A streams supported
        CLASS_A_SUPPORTED = 1 << 8;
        /// Class B streams supported
        CLASS_B_SUPPORTED = 1 << 9;
        /// gPTP supported
        GPTP_SUPPORTED = 1 << 10;
        /// AEM authentication supported
        AEM_AUTHENTICATION_SUPPORTED = 1 << 11;
        /// AEM authentication required
        AEM_AUTHENTICATION_REQUIRED = 1 << 12;
        /// Persistent acquire supported
        AEM_PERSISTENT_ACQUIRE_SUPPORTED = 1 << 13;
        /// identify_control_index valid
        AEM_IDENTIFY_CONTROL_INDEX_VALID = 1 << 14;
        /// interface_index valid
        AEM_INTERFACE_INDEX_VALID = 1 << 15;
        /// General controllers should ignore this entity
        GENERAL_CONTROLLER_IGNORE = 1 << 16;
        /// Entity not ready
        ENTITY_NOT_READY = 1 << 17;
    }
}

capability_flags! {
    /// ADP talker capabilities
    TalkerCapabilities(u16) {
        /// Talker implemented
        IMPLEMENTED = 1 << 0;
        /// Other source
        OTHER_SOURCE = 1 << 9;
        /// Control source
        CONTROL_SOURCE = 1 << 10;
        /// Media clock source
        MEDIA_CLOCK_SOURCE = 1 << 11;
        /// SMPTE source
        SMPTE_SOURCE = 1 << 12;
        /// MIDI source
        MIDI_SOURCE = 1 << 13;
        /// Audio source
        AUDIO_SOURCE = 1 << 14;
        /// Video source
        VIDEO_SOURCE = 1 << 15;
    }
}

capability_flags! {
    /// ADP listener capabilities
    ListenerCapabilities(u16) {
        /// Listener implemented
        IMPLEMENTED = 1 << 0;
        /// Other sink
        OTHER_SINK = 1 << 9;
        /// Control sink
        CONTROL_SINK = 1 << 10;
        /// Media clock sink
        MEDIA_CLOCK_SINK = 1 << 11;
        /// SMPTE sink
        SMPTE_SINK = 1 << 12;
        /// MIDI sink
        MIDI_SINK = 1 << 13;
        /// Audio sink
        AUDIO_SINK = 1 << 14;
        /// Video sink
        VIDEO_SINK = 1 << 15;
    }
}

capability_flags! {
    /// ADP controller capabilities
    ControllerCapabilities(u32) {
        /// Controller implemented
        IMPLEMENTED = 1 << 0;
    }
}

/// Entity information as carried by an ADP advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    /// Entity id
    pub entity_id: EntityId,
    /// Entity model id
    pub entity_model_id: u64,
    /// Entity capabilities
    pub entity_capabilities: EntityCapabilities,
    /// Number of talker stream sources
    pub talker_stream_sources: u16,
    /// Talker capabilities
    pub talker_capabilities: TalkerCapabilities,
    /// Number of listener stream sinks
    pub listener_stream_sinks: u16,
    /// Listener capabilities
    pub listener_capabilities: ListenerCapabilities,
    /// Controller capabilities
    pub controller_capabilities: ControllerCapabilities,
    /// Boot counter, constant for one session of the entity
    pub available_index: u32,
    /// Current gPTP grandmaster
    pub gptp_grandmaster_id: u64,
    /// Current gPTP domain
    pub gptp_domain_number: u8,
    /// CONTROL descriptor used for identification
    pub identify_control_index: u16,
    /// AVB_INTERFACE the advertisement was sent from
    pub interface_index: u16,
    /// Association id
    pub association_id: u64,
    /// Advertisement validity
    pub valid_time: Duration,
}

impl EntityInfo {
    /// Entity advertises a talker role
    #[must_use]
    pub fn is_talker(&self) -> bool {
        self.talker_capabilities
            .contains(TalkerCapabilities::IMPLEMENTED)
            && self.talker_stream_sources > 0
    }

    /// Entity advertises a listener role
    #[must_use]
    pub fn is_listener(&self) -> bool {
        self.listener_capabilities
            .contains(ListenerCapabilities::IMPLEMENTED)
            && self.listener_stream_sinks > 0
    }

    /// Entity advertises a controller role
    #[must_use]
    pub fn is_controller(&self) -> bool {
        self.controller_capabilities
            .contains(ControllerCapabilities::IMPLEMENTED)
    }
}

/// A remote entity as recorded in the entity directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntity {
    /// Latest advertised information
    pub info: EntityInfo,
    /// Source MAC of the latest advertisement
    pub mac_address: MacAddress,
    /// Port the entity was seen on
    pub port: u16,
    /// When the latest advertisement was received
    pub last_seen: Instant,
}

impl RemoteEntity {
    /// Entity id
    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.info.entity_id
    }

    /// Instant after which the entity is considered gone
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.last_seen + self.info.valid_time
    }
}
