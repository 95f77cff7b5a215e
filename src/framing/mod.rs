//! CCSDS TM Transfer Frame decoding and demultiplexing.
//!
//! TM Transfer Frames (CCSDS 132.0-B) are fixed-length and carry a portion
//! of a space packet stream in their data field, multiplexed over up to 8
//! virtual channels. [Demuxer] reassembles the per-channel packet streams;
//! [Frame] and [FrameHeader] expose the frame layout itself.
//!
//! # Example
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use tm_demux::framing::{demux_packets, FrameFormat};
//!
//! let fmt = FrameFormat::new(1115, 0, false, true).unwrap();
//! let file = BufReader::new(File::open("downlink.dat").unwrap());
//! for packet in demux_packets(file, fmt) {
//!     let packet = packet.unwrap();
//!     println!("{} bytes", packet.len());
//! }
//! ```

mod demux;

pub use demux::{demux_packets, Demuxed, Demuxer, PacketIter};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::bits::read_uint;
use crate::{Error, Result};

pub type Scid = u16;
pub type Vcid = u8;

/// Number of virtual channels addressable by the 3-bit VCID.
pub const VC_COUNT: usize = 8;

/// Fixed geometry of a mission's TM transfer frames.
///
/// All frames of a physical channel share one layout: total length, an
/// optional secondary header, and optional OCF/FECF trailer fields. The
/// trailer contents are opaque here; their lengths only position the data
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameFormat {
    frame_len: usize,
    secondary_header_len: usize,
    has_ocf: bool,
    has_fecf: bool,
}

impl FrameFormat {
    /// Operational control field length in bytes, when present.
    pub const OCF_LEN: usize = 4;
    /// Frame error control field length in bytes, when present.
    pub const FECF_LEN: usize = 2;

    /// Create a format for frames of `frame_len` total bytes with a
    /// `secondary_header_len`-byte secondary header (0 for none) and the
    /// given trailer fields.
    ///
    /// # Errors
    /// [Error::Config] if the headers and trailer leave no room for a data
    /// field of at least 1 byte.
    pub fn new(
        frame_len: usize,
        secondary_header_len: usize,
        has_ocf: bool,
        has_fecf: bool,
    ) -> Result<Self> {
        let fmt = FrameFormat {
            frame_len,
            secondary_header_len,
            has_ocf,
            has_fecf,
        };
        let minimum = fmt.headers_len() + fmt.trailer_len() + 1;
        if frame_len < minimum {
            return Err(Error::Config(format!(
                "frame length {frame_len} leaves no data field; minimum is {minimum}"
            )));
        }
        Ok(fmt)
    }

    /// Total frame length in bytes.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Primary plus secondary header length in bytes.
    #[must_use]
    pub fn headers_len(&self) -> usize {
        FrameHeader::LEN + self.secondary_header_len
    }

    /// Combined OCF and FECF length in bytes.
    #[must_use]
    pub fn trailer_len(&self) -> usize {
        let mut len = 0;
        if self.has_ocf {
            len += Self::OCF_LEN;
        }
        if self.has_fecf {
            len += Self::FECF_LEN;
        }
        len
    }

    /// Data field length in bytes, always at least 1.
    #[must_use]
    pub fn data_field_len(&self) -> usize {
        self.frame_len - self.headers_len() - self.trailer_len()
    }
}

/// Contents of a TM transfer frame primary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameHeader {
    pub version: u8,
    pub scid: Scid,
    pub vcid: Vcid,
    /// Operational control field flag as signalled in the header.
    pub has_ocf: bool,
    pub mc_frame_count: u8,
    pub vc_frame_count: u8,
    pub has_secondary_header: bool,
    pub synch_flag: bool,
    pub packet_order_flag: bool,
    pub segment_len_id: u8,
    /// First header pointer: offset into the data field of the first space
    /// packet header starting in this frame, or one of the sentinel values
    /// [FrameHeader::FHP_FILL] and [FrameHeader::FHP_NO_HEADER].
    pub fhp: u16,
}

impl FrameHeader {
    /// Primary header length in bytes.
    pub const LEN: usize = 6;
    /// First header pointer value indicating an idle frame of fill data.
    pub const FHP_FILL: u16 = 0x7fe;
    /// First header pointer value indicating no packet header starts within
    /// this frame's data field.
    pub const FHP_NO_HEADER: u16 = 0x7ff;

    /// Decode the primary header from the start of `dat`.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `dat` is shorter than [FrameHeader::LEN].
    pub fn decode(dat: &[u8]) -> Result<Self> {
        if dat.len() < Self::LEN {
            return Err(Error::NotEnoughData {
                actual: dat.len(),
                minimum: Self::LEN,
            });
        }

        Ok(FrameHeader {
            version: read_uint(dat, 0, 2)? as u8,
            scid: read_uint(dat, 2, 10)? as Scid,
            vcid: read_uint(dat, 12, 3)? as Vcid,
            has_ocf: read_uint(dat, 15, 1)? == 1,
            mc_frame_count: dat[2],
            vc_frame_count: dat[3],
            has_secondary_header: dat[4] >> 7 == 1,
            synch_flag: dat[4] >> 6 & 1 == 1,
            packet_order_flag: dat[4] >> 5 & 1 == 1,
            segment_len_id: dat[4] >> 3 & 0x3,
            fhp: u16::from(dat[4] & 0x07) << 8 | u16::from(dat[5]),
        })
    }

    /// True for idle frames whose data field is fill data.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        self.fhp == Self::FHP_FILL
    }

    /// True when a space packet header starts within this frame's data
    /// field.
    #[must_use]
    pub fn has_packet_start(&self) -> bool {
        self.fhp != Self::FHP_NO_HEADER && !self.is_fill()
    }
}

/// A single fixed-length TM transfer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    /// Whole frame bytes, headers and trailer included.
    pub data: Vec<u8>,
}

impl Frame {
    /// Decode `dat` into a ``Frame``. `dat` must hold at least one whole
    /// frame as described by `fmt`.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `dat` is shorter than the frame length.
    pub fn decode(dat: Vec<u8>, fmt: &FrameFormat) -> Result<Self> {
        if dat.len() < fmt.frame_len() {
            return Err(Error::NotEnoughData {
                actual: dat.len(),
                minimum: fmt.frame_len(),
            });
        }
        let header = FrameHeader::decode(&dat)?;
        Ok(Frame { header, data: dat })
    }

    /// Primary plus secondary header bytes.
    #[must_use]
    pub fn headers(&self, fmt: &FrameFormat) -> &[u8] {
        &self.data[..fmt.headers_len()]
    }

    /// The data field bytes carrying the space packet stream, trailer
    /// excluded.
    #[must_use]
    pub fn data_field(&self, fmt: &FrameFormat) -> &[u8] {
        &self.data[fmt.headers_len()..fmt.headers_len() + fmt.data_field_len()]
    }
}
