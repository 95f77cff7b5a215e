use std::collections::VecDeque;
use std::fmt::Display;
use std::io::{ErrorKind, Read};

use tracing::{debug, trace};

use super::{Frame, FrameFormat, FrameHeader, Vcid, VC_COUNT};
use crate::spacepacket::PrimaryHeader;
use crate::Result;

/// Per virtual channel reassembly state.
///
/// Packets are assembled oldest-first in `queue`. Only the last entry may be
/// incomplete, in which case `pending` is non-zero.
#[derive(Debug, Clone)]
struct VcidTracker {
    vcid: Vcid,
    queue: VecDeque<Vec<u8>>,
    /// Bytes still owed to the last entry in `queue`. While that entry holds
    /// fewer than 6 packet header bytes this counts header bytes; once the
    /// header is complete it counts the remaining data field bytes.
    pending: usize,
}

impl VcidTracker {
    fn new(vcid: Vcid) -> Self {
        VcidTracker {
            vcid,
            queue: VecDeque::new(),
            pending: 0,
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.pending = 0;
    }

    fn has_pending(&self) -> bool {
        self.pending > 0 && !self.queue.is_empty()
    }

    /// Feed the data field bytes owed to the pending packet, if any, and
    /// return the remainder of the data field starting at the first packet
    /// header indicated by `fhp`.
    ///
    /// Whenever the pending packet's length field and the fhp disagree the
    /// fhp wins, unless the length ends the packet before the fhp does; this
    /// is what lets the stream recover from a corrupt length field.
    fn handle_continuation<'a>(
        &mut self,
        data_field: &'a [u8],
        fhp: u16,
        prefix_len: usize,
    ) -> &'a [u8] {
        let no_header = fhp == FrameHeader::FHP_NO_HEADER;
        let vcid = self.vcid;

        if !self.has_pending() {
            if no_header {
                trace!(vcid, "nothing pending and no packet start, dropping data field");
                return &[];
            }
            // (Re)synchronize to the first packet header
            return &data_field[fhp as usize..];
        }

        let (mut continuation, rest) = if no_header {
            (data_field, &data_field[data_field.len()..])
        } else {
            data_field.split_at(fhp as usize)
        };

        let tail = self
            .queue
            .back_mut()
            .expect("pending bytes with no queued packet");

        // Complete the packet header first so its length field can be
        // trusted.
        if tail.len() - prefix_len < PrimaryHeader::LEN {
            let rest_of_header = self.pending;
            if continuation.len() < rest_of_header {
                tail.extend_from_slice(continuation);
                self.pending = 0;
                debug!(vcid, "packet header cut short at frame boundary");
                return rest;
            }
            let (head, more) = continuation.split_at(rest_of_header);
            tail.extend_from_slice(head);
            continuation = more;
            let header = PrimaryHeader::decode(&tail[prefix_len..])
                .expect("completed packet header failed to decode");
            self.pending = header.total_len() - PrimaryHeader::LEN;
        }

        if no_header {
            if self.pending < continuation.len() {
                // The length field says the packet ends inside this frame
                // even though the fhp claims otherwise. Trust the length and
                // wait for the next packet start to resynchronize.
                debug!(
                    vcid,
                    dropped = continuation.len() - self.pending,
                    "packet ends before its frame does, dropping excess"
                );
                let pending = self.pending;
                tail.extend_from_slice(&continuation[..pending]);
                self.pending = 0;
            } else {
                tail.extend_from_slice(continuation);
                self.pending -= continuation.len();
            }
            return rest;
        }

        // A packet starts at the fhp, so the pending one ends here no matter
        // what its length field claims.
        let take = continuation.len().min(self.pending);
        if take < continuation.len() {
            debug!(
                vcid,
                dropped = continuation.len() - take,
                "dropping bytes between packet end and next packet start"
            );
        } else if self.pending > continuation.len() {
            debug!(
                vcid,
                missing = self.pending - continuation.len(),
                "packet cut short by next packet start"
            );
        }
        tail.extend_from_slice(&continuation[..take]);
        self.pending = 0;
        rest
    }

    /// Carve packets out of `data`, which must start at a packet header.
    /// The last packet may be left incomplete, to be continued by the next
    /// frame. Each new packet starts with a copy of `prefix`.
    fn store_packets(&mut self, mut data: &[u8], prefix: &[u8]) {
        while !data.is_empty() {
            let mut packet = prefix.to_vec();
            if data.len() < PrimaryHeader::LEN {
                packet.extend_from_slice(data);
                self.pending = PrimaryHeader::LEN - data.len();
                self.queue.push_back(packet);
                return;
            }
            let total = PrimaryHeader::decode(data)
                .expect("failed to decode primary header")
                .total_len();
            if total > data.len() {
                packet.extend_from_slice(data);
                self.pending = total - data.len();
                self.queue.push_back(packet);
                return;
            }
            let (head, tail) = data.split_at(total);
            packet.extend_from_slice(head);
            self.queue.push_back(packet);
            data = tail;
        }
    }
}

impl Display for VcidTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VcidTracker{{vcid={}, queued={}, pending={}}}",
            self.vcid,
            self.queue.len(),
            self.pending
        )
    }
}

/// One step of demultiplexer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demuxed {
    /// A complete space packet, frame headers prepended when packet
    /// prefixing is enabled.
    Packet(Vec<u8>),
    /// More frame bytes are required before a packet can be produced.
    NeedMore,
    /// An empty input produced nothing; chained consumers may forward an
    /// empty delivery.
    PassThrough,
}

/// Demultiplexes a continuous stream of fixed-length TM transfer frames
/// into the space packets carried by their data fields.
///
/// Bytes are accumulated until a whole frame is available, the frame is
/// dispatched to its virtual channel for reassembly, and completed packets
/// are handed back one per [Demuxer::consume] call. Idle frames are
/// discarded outright; idle packets are discarded when they are pulled,
/// unless [Demuxer::with_fill_packets] is set.
///
/// Within a virtual channel packets come out in wire order. Across channels
/// they come out in ascending VCID order whenever more than one channel has
/// completed packets waiting.
#[derive(Debug, Clone)]
pub struct Demuxer {
    fmt: FrameFormat,
    prefix_packets: bool,
    include_fill: bool,
    acc: VecDeque<u8>,
    trackers: [VcidTracker; VC_COUNT],
}

impl Demuxer {
    pub fn new(fmt: FrameFormat) -> Self {
        Demuxer {
            fmt,
            prefix_packets: false,
            include_fill: false,
            acc: VecDeque::new(),
            trackers: std::array::from_fn(|vcid| VcidTracker::new(vcid as Vcid)),
        }
    }

    /// Prepend each packet with the primary and secondary header bytes of
    /// the frame its first byte arrived in.
    #[must_use]
    pub fn with_packet_prefix(mut self) -> Self {
        self.prefix_packets = true;
        self
    }

    /// Pass idle packets through instead of discarding them.
    #[must_use]
    pub fn with_fill_packets(mut self) -> Self {
        self.include_fill = true;
        self
    }

    /// The frame geometry this demultiplexer was built for.
    #[must_use]
    pub fn format(&self) -> &FrameFormat {
        &self.fmt
    }

    /// Drop all accumulated stream and reassembly state, returning the
    /// demultiplexer to its freshly constructed condition.
    pub fn reset(&mut self) {
        self.acc.clear();
        for tracker in &mut self.trackers {
            tracker.reset();
        }
    }

    /// Feed `bytes` to the demultiplexer and take one step.
    ///
    /// At most one whole frame is processed per call even when more input
    /// has accumulated; keep calling with an empty slice to drain buffered
    /// frames and queued packets.
    pub fn consume(&mut self, bytes: &[u8]) -> Demuxed {
        self.acc.extend(bytes);
        if self.acc.len() >= self.fmt.frame_len() {
            let dat: Vec<u8> = self.acc.drain(..self.fmt.frame_len()).collect();
            let frame = Frame::decode(dat, &self.fmt).expect("accumulator drained a short frame");
            self.handle_frame(&frame);
        }
        match self.next_packet() {
            Some(packet) => Demuxed::Packet(packet),
            None if bytes.is_empty() => Demuxed::PassThrough,
            None => Demuxed::NeedMore,
        }
    }

    fn prefix_len(&self) -> usize {
        if self.prefix_packets {
            self.fmt.headers_len()
        } else {
            0
        }
    }

    fn handle_frame(&mut self, frame: &Frame) {
        let header = &frame.header;
        if header.is_fill() {
            trace!(vcid = header.vcid, "fill frame, dropping");
            return;
        }

        let data_field = frame.data_field(&self.fmt);
        if header.has_packet_start() && header.fhp as usize >= data_field.len() {
            debug!(
                vcid = header.vcid,
                fhp = header.fhp,
                len = data_field.len(),
                "first header pointer outside data field, dropping frame"
            );
            return;
        }

        let prefix_len = self.prefix_len();
        let prefix = &frame.headers(&self.fmt)[..prefix_len];
        let tracker = &mut self.trackers[usize::from(header.vcid)];
        trace!(tracker = %tracker, fhp = header.fhp, "handling frame");

        let rest = tracker.handle_continuation(data_field, header.fhp, prefix_len);
        if header.has_packet_start() {
            tracker.store_packets(rest, prefix);
        }
    }

    /// Pop the oldest completed packet, scanning virtual channels in
    /// ascending VCID order.
    fn next_packet(&mut self) -> Option<Vec<u8>> {
        let include_fill = self.include_fill;
        let off = self.prefix_len();

        for tracker in &mut self.trackers {
            loop {
                if tracker.queue.len() == 1 && tracker.pending > 0 {
                    // Sole entry is still being assembled
                    break;
                }
                let Some(packet) = tracker.queue.pop_front() else {
                    break;
                };
                if include_fill {
                    return Some(packet);
                }
                // A stub too short to carry an APID field cannot be
                // classified; hand it over as is.
                let apid = match packet.get(off..off + 2) {
                    Some(b) => u16::from_be_bytes([b[0], b[1]]) & 0x7ff,
                    None => return Some(packet),
                };
                if apid != PrimaryHeader::APID_FILL {
                    return Some(packet);
                }
                trace!(vcid = tracker.vcid, "dropping fill packet");
            }
        }
        None
    }
}

/// Iterator over demultiplexed packets read from a byte stream of frames.
///
/// Created with [demux_packets]. Any partial frame at the end of the stream
/// is dropped.
pub struct PacketIter<R>
where
    R: Read + Send,
{
    reader: R,
    demux: Demuxer,
    buf: Vec<u8>,
    eof: bool,
}

impl<R> Iterator for PacketIter<R>
where
    R: Read + Send,
{
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Demuxed::Packet(packet) = self.demux.consume(&[]) {
                return Some(Ok(packet));
            }
            if self.eof {
                return None;
            }
            if let Err(err) = self.reader.read_exact(&mut self.buf) {
                if err.kind() == ErrorKind::UnexpectedEof {
                    self.eof = true;
                    continue;
                }
                return Some(Err(err.into()));
            }
            if let Demuxed::Packet(packet) = self.demux.consume(&self.buf) {
                return Some(Ok(packet));
            }
        }
    }
}

/// Return an iterator providing packet data demultiplexed from whole frames
/// read from `reader`.
///
/// The stream must be frame aligned, e.g., the output of a CADU
/// synchronizer with sync markers removed. Reading stops at EOF.
///
/// # Errors
/// Iterator items are [Err] for any read error other than EOF.
pub fn demux_packets<R>(reader: R, fmt: FrameFormat) -> PacketIter<R>
where
    R: Read + Send,
{
    let buf = vec![0u8; fmt.frame_len()];
    PacketIter {
        reader,
        demux: Demuxer::new(fmt),
        buf,
        eof: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demuxer(frame_len: usize) -> Demuxer {
        Demuxer::new(FrameFormat::new(frame_len, 0, false, false).unwrap())
    }

    fn drain(demux: &mut Demuxer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        // Generous bound; each call handles at most one buffered frame
        for _ in 0..64 {
            if let Demuxed::Packet(packet) = demux.consume(&[]) {
                out.push(packet);
            }
        }
        out
    }

    #[test]
    fn single_packet_fills_data_field() {
        let mut demux = demuxer(13);
        let frame: &[u8] = &[
            0x02, 0x02, 0x03, 0x04, 0x00, 0x00, // fhp 0
            0x05, 0x06, 0x07, 0x08, 0x00, 0x00, 0xda,
        ];

        let zult = demux.consume(frame);
        assert_eq!(
            zult,
            Demuxed::Packet(vec![0x05, 0x06, 0x07, 0x08, 0x00, 0x00, 0xda])
        );
        assert_eq!(demux.consume(&[]), Demuxed::PassThrough);
    }

    #[test]
    fn partial_frame_needs_more() {
        let mut demux = demuxer(13);
        assert_eq!(demux.consume(&[0x02, 0x02, 0x03]), Demuxed::NeedMore);
        assert_eq!(demux.consume(&[]), Demuxed::PassThrough);
    }

    #[test]
    fn fill_frame_is_dropped() {
        let mut demux = demuxer(14);
        let frame: &[u8] = &[
            0x01, 0x02, 0x03, 0x04, 0x07, 0xfe, // fhp 0x7fe
            0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
        ];
        assert_eq!(demux.consume(frame), Demuxed::NeedMore);
        assert_eq!(demux.consume(&[]), Demuxed::PassThrough);
    }

    #[test]
    fn no_packet_start_without_pending_drops_data_field() {
        let mut demux = demuxer(14);
        let frame: &[u8] = &[
            0x01, 0x02, 0x03, 0x04, 0x07, 0xff, // fhp 0x7ff
            0xda, 0xda, 0xda, 0xda, 0xda, 0xda, 0xda, 0xda,
        ];
        assert_eq!(demux.consume(frame), Demuxed::NeedMore);

        // The channel must still be in sync for the next packet start
        let frame: &[u8] = &[
            0x01, 0x02, 0x03, 0x05, 0x00, 0x01, // fhp 1
            0xff, 0x14, 0x15, 0x16, 0x17, 0x00, 0x00, 0xda,
        ];
        let zult = demux.consume(frame);
        assert_eq!(
            zult,
            Demuxed::Packet(vec![0x14, 0x15, 0x16, 0x17, 0x00, 0x00, 0xda])
        );
    }

    #[test]
    fn packet_spanning_three_frames() {
        let mut demux = demuxer(14);
        // 24 total bytes: 6 header + 18 data, filling three 8-byte fields
        let frame_a: &[u8] = &[
            0x01, 0x02, 0x00, 0x00, 0x00, 0x00, // fhp 0
            0x05, 0x06, 0x07, 0x08, 0x00, 0x11, 0x01, 0x02,
        ];
        let frame_b: &[u8] = &[
            0x01, 0x02, 0x00, 0x01, 0x07, 0xff, // continuation only
            0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a,
        ];
        let frame_c: &[u8] = &[
            0x01, 0x02, 0x00, 0x02, 0x07, 0xff, // continuation only
            0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11, 0x12,
        ];

        assert_eq!(demux.consume(frame_a), Demuxed::NeedMore);
        assert_eq!(demux.consume(frame_b), Demuxed::NeedMore);
        let Demuxed::Packet(packet) = demux.consume(frame_c) else {
            panic!("expected packet after final continuation");
        };
        assert_eq!(packet.len(), 24);
        assert_eq!(&packet[..6], &[0x05, 0x06, 0x07, 0x08, 0x00, 0x11]);
        assert_eq!(packet[23], 0x12);
        assert_eq!(demux.consume(&[]), Demuxed::PassThrough);
    }

    #[test]
    fn packet_header_split_across_frames() {
        let mut demux = demuxer(14);
        // Packet starts at offset 5, leaving only 3 header bytes here
        let frame_a: &[u8] = &[
            0x01, 0x02, 0x00, 0x00, 0x00, 0x05, // fhp 5
            0xff, 0xff, 0xff, 0xff, 0xff, 0x14, 0x15, 0x16,
        ];
        // Header completes 3 bytes in, then 2 data bytes finish the packet
        let frame_b: &[u8] = &[
            0x01, 0x02, 0x00, 0x01, 0x00, 0x05, // fhp 5
            0x17, 0x00, 0x01, 0xda, 0xda, 0x18, 0x19, 0x1a,
        ];

        assert_eq!(demux.consume(frame_a), Demuxed::NeedMore);
        let Demuxed::Packet(packet) = demux.consume(frame_b) else {
            panic!("expected completed packet");
        };
        assert_eq!(packet, [0x14, 0x15, 0x16, 0x17, 0x00, 0x01, 0xda, 0xda]);
    }

    #[test]
    fn truncated_header_stub_is_emitted() {
        let mut demux = demuxer(14);
        // Two header bytes arrive, then the next frame insists a new packet
        // starts immediately
        let frame_a: &[u8] = &[
            0x01, 0x02, 0x00, 0x00, 0x00, 0x06, // fhp 6
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x3e, 0x01,
        ];
        let frame_b: &[u8] = &[
            0x01, 0x02, 0x00, 0x01, 0x00, 0x00, // fhp 0
            0x14, 0x15, 0x16, 0x17, 0x00, 0x00, 0xda, 0xda,
        ];

        assert_eq!(demux.consume(frame_a), Demuxed::NeedMore);
        // The stub comes out first, then the new packet
        assert_eq!(demux.consume(frame_b), Demuxed::Packet(vec![0x3e, 0x01]));
        assert_eq!(
            demux.consume(&[]),
            Demuxed::Packet(vec![0x14, 0x15, 0x16, 0x17, 0x00, 0x00, 0xda])
        );
    }

    #[test]
    fn length_ends_packet_inside_continuation_frame() {
        let mut demux = demuxer(14);
        // Packet wants 1 more byte but the frame claims pure continuation;
        // the length wins and the rest of the data field is unclaimed
        let frame_a: &[u8] = &[
            0x01, 0x02, 0x00, 0x00, 0x00, 0x00, // fhp 0
            0x05, 0x06, 0x07, 0x08, 0x00, 0x02, 0xda, 0xda,
        ];
        let frame_b: &[u8] = &[
            0x01, 0x02, 0x00, 0x01, 0x07, 0xff, // no packet start
            0xda, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        ];

        assert_eq!(demux.consume(frame_a), Demuxed::NeedMore);
        assert_eq!(
            demux.consume(frame_b),
            Demuxed::Packet(vec![0x05, 0x06, 0x07, 0x08, 0x00, 0x02, 0xda, 0xda, 0xda])
        );
        assert_eq!(demux.consume(&[]), Demuxed::PassThrough);
    }

    #[test]
    fn invalid_fhp_drops_frame_but_keeps_pending() {
        let mut demux = demuxer(14);
        let frame_a: &[u8] = &[
            0x01, 0x02, 0x00, 0x00, 0x00, 0x00, // fhp 0
            0x05, 0x06, 0x07, 0x08, 0x00, 0x02, 0xda, 0xda,
        ];
        // fhp 0x100 is far outside the 8-byte data field
        let frame_bad: &[u8] = &[
            0x01, 0x02, 0x00, 0x01, 0x01, 0x00, // fhp 256
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        ];
        let frame_c: &[u8] = &[
            0x01, 0x02, 0x00, 0x02, 0x00, 0x01, // fhp 1
            0xda, 0x14, 0x15, 0x16, 0x17, 0x00, 0x00, 0xda,
        ];

        assert_eq!(demux.consume(frame_a), Demuxed::NeedMore);
        assert_eq!(demux.consume(frame_bad), Demuxed::NeedMore);
        // The pending packet still completes from the next good frame
        assert_eq!(
            demux.consume(frame_c),
            Demuxed::Packet(vec![0x05, 0x06, 0x07, 0x08, 0x00, 0x02, 0xda, 0xda, 0xda])
        );
        assert_eq!(
            demux.consume(&[]),
            Demuxed::Packet(vec![0x14, 0x15, 0x16, 0x17, 0x00, 0x00, 0xda])
        );
    }

    #[test]
    fn fill_packets_kept_when_configured() {
        let fmt = FrameFormat::new(15, 0, false, false).unwrap();
        let frame: &[u8] = &[
            0x01, 0x02, 0x03, 0x04, 0x00, 0x00, // fhp 0
            0x3f, 0xff, 0x09, 0x0a, 0x00, 0x02, 0x5a, 0x5a, 0x5a,
        ];

        let mut demux = Demuxer::new(fmt);
        assert_eq!(demux.consume(frame), Demuxed::NeedMore);

        let mut demux = Demuxer::new(fmt).with_fill_packets();
        assert_eq!(
            demux.consume(frame),
            Demuxed::Packet(vec![0x3f, 0xff, 0x09, 0x0a, 0x00, 0x02, 0x5a, 0x5a, 0x5a])
        );
    }

    #[test]
    fn reset_clears_accumulator_and_trackers() {
        let mut demux = demuxer(14);
        let frame_a: &[u8] = &[
            0x01, 0x02, 0x00, 0x00, 0x00, 0x00, // fhp 0
            0x05, 0x06, 0x07, 0x08, 0x00, 0x02, 0xda, 0xda,
        ];
        assert_eq!(demux.consume(frame_a), Demuxed::NeedMore);
        assert_eq!(demux.consume(&frame_a[..3]), Demuxed::NeedMore);

        demux.reset();

        // The old continuation must be gone; a fresh frame stands alone
        let frame: &[u8] = &[
            0x01, 0x02, 0x00, 0x05, 0x00, 0x00, // fhp 0
            0x14, 0x15, 0x16, 0x17, 0x00, 0x01, 0xda, 0xda,
        ];
        assert_eq!(
            demux.consume(frame),
            Demuxed::Packet(vec![0x14, 0x15, 0x16, 0x17, 0x00, 0x01, 0xda, 0xda])
        );
        assert_eq!(demux.consume(&[]), Demuxed::PassThrough);
    }

    #[test]
    fn one_frame_consumed_per_call() {
        let mut demux = demuxer(13);
        let frame: &[u8] = &[
            0x02, 0x02, 0x03, 0x04, 0x00, 0x00, // fhp 0
            0x05, 0x06, 0x07, 0x08, 0x00, 0x00, 0xda,
        ];
        let mut stream = frame.to_vec();
        stream.extend_from_slice(frame);
        stream.extend_from_slice(frame);

        let Demuxed::Packet(_) = demux.consume(&stream) else {
            panic!("expected first packet");
        };
        assert_eq!(drain(&mut demux).len(), 2);
    }
}
