//! Wire formats of the AVDECC control protocols (IEEE 1722.1)

pub mod acmp;
pub mod adp;
pub mod aecp;
pub mod aem;
pub mod avtp;

#[cfg(test)]
mod tests;

use bytes::Bytes;
use thiserror::Error;

pub use acmp::{AcmpFlags, AcmpMessageType, AcmpPdu, AcmpStatus};
pub use adp::{AdpMessageType, AdpPdu};
pub use aecp::{
    AecpBody, AecpMessageType, AecpPdu, AecpStatus, AemCommandType, MILAN_PROTOCOL_ID, MilanInfo,
    MvuCommandType,
};
pub use aem::{Descriptor, DescriptorBody, DescriptorRef, DescriptorType};
pub use avtp::{AVTP_ETHERTYPE, ControlHeader, Subtype};

/// Errors decoding a control PDU
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PduError {
    /// Not enough bytes for the fixed layout
    #[error("PDU too short: need {needed} bytes, have {have}")]
    TooShort {
        /// Bytes required
        needed: usize,
        /// Bytes available
        have: usize,
    },

    /// Subtype is not ADP, AECP or ACMP
    #[error("unknown subtype: 0x{0:02x}")]
    UnknownSubtype(u8),

    /// AVTP version other than 0
    #[error("unsupported AVTP version: {0}")]
    UnsupportedVersion(u8),

    /// Message type undefined for the protocol
    #[error("unknown {protocol} message type: {value}")]
    UnknownMessageType {
        /// Protocol the message belongs to
        protocol: Subtype,
        /// Raw value
        value: u8,
    },

    /// `control_data_length` disagrees with the frame
    #[error("control_data_length {declared} exceeds {available} available bytes")]
    LengthMismatch {
        /// Length declared in the header
        declared: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Field carries a reserved value
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Raw value
        value: u64,
    },
}

/// Any AVDECC control PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPdu {
    /// Discovery
    Adp(AdpPdu),
    /// Enumeration and control
    Aecp(AecpPdu),
    /// Connection management
    Acmp(AcmpPdu),
}

impl ControlPdu {
    /// Decode the payload of an AVTP Ethernet frame
    ///
    /// # Errors
    ///
    /// Returns a `PduError` describing why the frame is malformed.
    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        let (header, body) = ControlHeader::decode(data)?;
        Ok(match header.subtype {
            Subtype::Adp => Self::Adp(AdpPdu::decode_body(&header, body)?),
            Subtype::Aecp => Self::Aecp(AecpPdu::decode_body(&header, body)?),
            Subtype::Acmp => Self::Acmp(AcmpPdu::decode_body(&header, body)?),
        })
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Adp(pdu) => pdu.encode(),
            Self::Aecp(pdu) => pdu.encode(),
            Self::Acmp(pdu) => pdu.encode(),
        }
    }

    /// Subtype of this PDU
    #[must_use]
    pub fn subtype(&self) -> Subtype {
        match self {
            Self::Adp(_) => Subtype::Adp,
            Self::Aecp(_) => Subtype::Aecp,
            Self::Acmp(_) => Subtype::Acmp,
        }
    }
}
