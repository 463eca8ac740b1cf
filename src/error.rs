use std::io;
use thiserror::Error;

use crate::protocol::PduError;
use crate::protocol::acmp::AcmpStatus;
use crate::protocol::aecp::AecpStatus;
use crate::types::EntityId;

/// Generic return code of the control channel.
///
/// Independent of the protocol-specific status codes carried by AECP and
/// ACMP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    /// Operation completed
    Success,
    /// Caller supplied an invalid parameter
    InvalidParams,
    /// No free slot or capacity to accept the request
    NoResources,
    /// No response after all retries
    Timeout,
    /// Stack not running or not able to serve the request
    NotReady,
    /// Remote entity answered with a non-success status, or sent a bad PDU
    ProtocolError,
    /// Frame could not be handed to the network
    TransportError,
}

/// Errors that can occur during AVDECC operations
#[derive(Debug, Error)]
pub enum AvdeccError {
    // ===== Transport Errors =====
    /// The transport adapter refused the frame
    #[error("transport error on port {port}: {message}")]
    Transport {
        /// Logical port the frame was sent on
        port: u16,
        /// Description of the failure
        message: String,
        /// The underlying source of the error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // ===== Protocol Errors =====
    /// AECP response carried a non-success status
    #[error("AECP command failed with status {0}")]
    AecpStatus(AecpStatus),

    /// ACMP response carried a non-success status
    #[error("ACMP command failed with status {0}")]
    AcmpStatus(AcmpStatus),

    /// Received PDU could not be decoded
    #[error("malformed PDU: {0}")]
    Pdu(#[from] PduError),

    /// Response did not have the expected shape
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// What was expected
        expected: String,
        /// What was actually received
        actual: String,
    },

    // ===== Timeouts =====
    /// No response after all retries
    #[error("command to {target} timed out")]
    Timeout {
        /// Entity the command was addressed to
        target: EntityId,
    },

    // ===== Resource Errors =====
    /// Transaction tracker has no free slot
    #[error("no free transaction slot (capacity {capacity})")]
    NoResources {
        /// Configured capacity
        capacity: usize,
    },

    // ===== Lookup Errors =====
    /// Entity is not present in the directory
    #[error("entity not found: {entity_id}")]
    EntityNotFound {
        /// The ID of the entity that was not found
        entity_id: EntityId,
    },

    /// Invalid parameter provided
    #[error("invalid parameter: {name} - {message}")]
    InvalidParameter {
        /// The name of the parameter
        name: String,
        /// Description of the error
        message: String,
    },

    // ===== State Errors =====
    /// The control channel is not running
    #[error("control channel not ready")]
    NotReady,

    /// The transaction was cancelled before a response arrived
    #[error("transaction cancelled")]
    Cancelled,

    // ===== Configuration Errors =====
    /// Configuration could not be parsed or is inconsistent
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem
        message: String,
    },

    /// I/O error while loading configuration
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AvdeccError {
    /// Check if this error is recoverable by retrying later
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transport { .. } | Self::NoResources { .. }
        )
    }

    /// Map onto the generic control-channel return code
    #[must_use]
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::Transport { .. } | Self::Io(_) => ReturnCode::TransportError,
            Self::AecpStatus(_)
            | Self::AcmpStatus(_)
            | Self::Pdu(_)
            | Self::UnexpectedResponse { .. } => ReturnCode::ProtocolError,
            Self::Timeout { .. } => ReturnCode::Timeout,
            Self::NoResources { .. } => ReturnCode::NoResources,
            Self::EntityNotFound { .. } | Self::InvalidParameter { .. } | Self::Config { .. } => {
                ReturnCode::InvalidParams
            }
            Self::NotReady | Self::Cancelled => ReturnCode::NotReady,
        }
    }

    /// Shorthand for a transport failure without an underlying source
    pub(crate) fn transport(port: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            port,
            message: message.into(),
            source: None,
        }
    }
}

/// Result type alias for AVDECC operations
pub type Result<T> = std::result::Result<T, AvdeccError>;
