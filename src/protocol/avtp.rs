//! AVTP control header shared by ADP, AECP and ACMP.
//!
//! Layout (12 bytes, big-endian):
//!
//! ```text
//! | subtype (8) | sv (1) | version (3) | message_type (4) |
//! | status (5) | control_data_length (11) |
//! | entity_id / target_entity_id / stream_id (64) |
//! ```

use bytes::{BufMut, BytesMut};

use super::PduError;

/// EtherType of IEEE 1722 frames
pub const AVTP_ETHERTYPE: u16 = 0x22F0;

/// Largest `control_data_length` the 11-bit field can carry in practice
pub const MAX_CONTROL_DATA_LENGTH: usize = 524;

/// AVTP control subtypes handled by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Subtype {
    /// AVDECC Discovery Protocol
    Adp = 0xFA,
    /// AVDECC Enumeration and Control Protocol
    Aecp = 0xFB,
    /// AVDECC Connection Management Protocol
    Acmp = 0xFC,
}

impl Subtype {
    /// Parse the first byte of an AVTP control frame
    ///
    /// # Errors
    ///
    /// Returns `PduError::UnknownSubtype` for anything but ADP, AECP or ACMP.
    pub fn from_u8(value: u8) -> Result<Self, PduError> {
        match value {
            0xFA => Ok(Self::Adp),
            0xFB => Ok(Self::Aecp),
            0xFC => Ok(Self::Acmp),
            other => Err(PduError::UnknownSubtype(other)),
        }
    }
}

impl std::fmt::Display for Subtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adp => write!(f, "ADP"),
            Self::Aecp => write!(f, "AECP"),
            Self::Acmp => write!(f, "ACMP"),
        }
    }
}

/// Decoded control header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Protocol subtype
    pub subtype: Subtype,
    /// Raw 4-bit message type, interpreted by each protocol
    pub message_type: u8,
    /// Raw 5-bit status (valid_time for ADP)
    pub status: u8,
    /// Number of bytes following the header
    pub control_data_length: u16,
    /// Entity id, target entity id or stream id depending on the protocol
    pub id: u64,
}

impl ControlHeader {
    /// Header size in bytes
    pub const SIZE: usize = 12;

    /// Only version 0 is defined
    pub const VERSION: u8 = 0;

    /// Append the header to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.subtype as u8);
        buf.put_u8((Self::VERSION << 4) | (self.message_type & 0x0F));
        buf.put_u16((u16::from(self.status & 0x1F) << 11) | (self.control_data_length & 0x07FF));
        buf.put_u64(self.id);
    }

    /// Decode a header and return it with exactly `control_data_length`
    /// bytes of body.
    ///
    /// # Errors
    ///
    /// Fails on short input, unknown subtype, non-zero version, or a
    /// declared length that runs past the end of the frame.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), PduError> {
        if data.len() < Self::SIZE {
            return Err(PduError::TooShort {
                needed: Self::SIZE,
                have: data.len(),
            });
        }
        let subtype = Subtype::from_u8(data[0])?;
        let version = (data[1] >> 4) & 0x07;
        if version != Self::VERSION {
            return Err(PduError::UnsupportedVersion(version));
        }
        let word = u16::from_be_bytes([data[2], data[3]]);
        let control_data_length = word & 0x07FF;
        let available = data.len() - Self::SIZE;
        let declared = usize::from(control_data_length);
        if declared > available || declared > MAX_CONTROL_DATA_LENGTH {
            return Err(PduError::LengthMismatch {
                declared,
                available,
            });
        }
        let header = Self {
            subtype,
            message_type: data[1] & 0x0F,
            status: (word >> 11) as u8,
            control_data_length,
            id: u64::from_be_bytes([
                data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
            ]),
        };
        Ok((header, &data[Self::SIZE..Self::SIZE + declared]))
    }
}

/// Check that a body holds at least the fixed part of a PDU
pub(crate) fn require_len(body: &[u8], needed: usize) -> Result<(), PduError> {
    if body.len() < needed {
        return Err(PduError::TooShort {
            needed,
            have: body.len(),
        });
    }
    Ok(())
}
