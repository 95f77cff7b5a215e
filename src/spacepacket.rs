//! CCSDS Space Packet header decoding (CCSDS 133.0-B).

use crate::{Error, Result};

pub type Apid = u16;

/// CCSDS space packet primary header.
///
/// The primary header format is common to all CCSDS space packets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    pub sequence_flags: u8,
    pub sequence_id: u16,
    /// Packet data field length minus one, as encoded on the wire.
    pub len_minus1: u16,
}

impl PrimaryHeader {
    /// Size of a ``PrimaryHeader``
    pub const LEN: usize = 6;
    /// APID of idle packets inserted for padding, all 11 bits set.
    pub const APID_FILL: Apid = 0x7ff;

    /// Decode from bytes.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if there are not enough bytes to construct the
    /// header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: Self::LEN,
            });
        }
        let d1 = u16::from_be_bytes([buf[0], buf[1]]);
        let d2 = u16::from_be_bytes([buf[2], buf[3]]);
        let d3 = u16::from_be_bytes([buf[4], buf[5]]);

        Ok(PrimaryHeader {
            version: (d1 >> 13 & 0x7) as u8,
            type_flag: (d1 >> 12 & 0x1) as u8,
            has_secondary_header: (d1 >> 11 & 0x1) == 1,
            apid: (d1 & 0x7ff),
            sequence_flags: (d2 >> 14 & 0x3) as u8,
            sequence_id: (d2 & 0x3fff),
            len_minus1: d3,
        })
    }

    /// Total packet length in bytes, header included.
    #[must_use]
    pub fn total_len(&self) -> usize {
        Self::LEN + self.len_minus1 as usize + 1
    }

    /// True for idle packets, which carry fill data only.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        self.apid == Self::APID_FILL
    }
}
