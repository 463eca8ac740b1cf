//! # avdecc
//!
//! A pure Rust implementation of the IEEE 1722.1 control plane (AVDECC)
//! for AVB/TSN entities.
//!
//! ## Features
//!
//! - Entity discovery (ADP) with a live directory of remote entities
//! - Enumeration and control (AECP): AEM, vendor unique and Milan commands
//! - Stream connection management (ACMP) for talkers, listeners and
//!   controllers
//! - Retries and timeouts through a shared transaction tracker
//!
//! ## Example
//!
//! ```rust,no_run
//! use avdecc::net::StaticGptp;
//! use avdecc::testing::{RecordingStreaming, VirtualNetwork, controller_config};
//! use avdecc::AvdeccStack;
//!
//! # async fn example() -> Result<(), avdecc::AvdeccError> {
//! let network = VirtualNetwork::new();
//! let config = controller_config(1);
//! let (port, frames) = network.attach(config.mac_address);
//!
//! let stack = AvdeccStack::new(config, port, RecordingStreaming::new(), StaticGptp::default())?;
//! let handle = stack.spawn(frames);
//!
//! handle.discover(None).await?;
//! for entity in handle.entities().await? {
//!     println!("found {}", entity.entity_id());
//! }
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The library is organized into layers:
//!
//! - **High-level**: `AvdeccHandle` - async API to a stack running on a task
//! - **Mid-level**: `AvdeccStack` - synchronous dispatch of frames, requests and timers
//! - **Low-level**: `engine` and `protocol` - state machines and wire formats

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
/// Error types
pub mod error;
/// Event notifications
pub mod state;
/// Core types
pub mod types;

/// Testing utilities
pub mod testing;

// Internal modules
pub mod directory;
pub mod engine;
pub mod net;
pub mod protocol;
mod stack;
pub mod transaction;

// Re-exports
pub use directory::EntityDirectory;
pub use engine::{ConnectionState, StreamConnection};
pub use error::{AvdeccError, Result, ReturnCode};
pub use net::{Frame, GptpInfo, StreamingBackend, Transport};
pub use stack::{AvdeccHandle, AvdeccStack};
pub use state::{AvdeccEvent, DepartureReason, EventFilter};
pub use types::{AvdeccConfig, EntityId, EntityInfo, MacAddress, RemoteEntity, StreamId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
///
/// Convenient re-exports
pub mod prelude {
    pub use crate::protocol::{AcmpFlags, AemCommandType, DescriptorRef, DescriptorType};
    pub use crate::{
        AvdeccConfig, AvdeccError, AvdeccEvent, AvdeccHandle, AvdeccStack, ConnectionState,
        DepartureReason, EntityId, MacAddress, RemoteEntity, StreamConnection,
    };
}
