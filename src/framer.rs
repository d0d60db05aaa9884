//! Message framing.
//!
//! A framer drives the read actor: it announces how many bytes to read
//! next, accumulates them in its work buffer, and reports when a complete
//! message has been assembled. It also encodes outbound payloads into the
//! ordered buffer sequence handed to the write actor.
//!
//! The default wire format is a 4-byte little-endian payload length
//! followed by the payload: no magic bytes, no version, no checksum. The
//! extended layout additionally carries a header-size byte, a 64-bit
//! channel tag and a 16-bit identifier; the size byte counts the whole
//! header including itself so readers can skip headers grown by future
//! revisions.

use bytes::Bytes;
use thiserror::Error;
use tracing::error;

/// Opaque per-message tag carried alongside the payload. Only written to
/// the wire by the extended layout; the library never interprets it.
pub type Channel = u64;

/// Default cap on the declared payload length.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const BASIC_HEADER_LEN: usize = 4;
const EXTENDED_HEADER_LEN: usize = 15;
/// Sanity bound for forward-compatible extended headers.
const MAX_HEADER_LEN: usize = 64;

/// Framing failure. Either one tears the connection down as data
/// corruption.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("declared payload length {len} exceeds cap {max}")]
    OversizedPayload { len: usize, max: usize },

    /// The read actor appended a different byte count than the framer
    /// requested. This is a bug in the caller, not a wire problem.
    #[error("framer advanced by {got} bytes, expected {expected}")]
    WrongAdvance { expected: usize, got: usize },

    #[error("declared header length {0} is out of range")]
    BadHeaderLength(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOpKind {
    /// Read the 1-byte header-size prefix (extended layout only).
    HeaderSize,
    /// Read the remainder of the header.
    Header,
    /// Read the payload itself.
    Payload,
}

/// The next read the actor must perform: exactly `len` bytes appended to
/// the work buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOp {
    pub kind: ReadOpKind,
    pub len: usize,
}

/// Buffer strategy of a connection's framer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramerKind {
    /// Separate header and payload buffers; the payload buffer becomes
    /// the message without a copy. Preferred for stream transports.
    #[default]
    MultiBuffer,
    /// One growing buffer with the header overlaid at the front; assembly
    /// reorders the overlapping bytes in place.
    SingleBuffer,
}

/// Wire header layout, fixed per connection at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeaderLayout {
    /// `[payload_size: u32 LE]`
    #[default]
    Basic,
    /// `[header_size: u8][payload_size: u32 LE][channel: u64 LE][id: u16 LE]`
    Extended,
}

/// Per-connection framing options.
#[derive(Clone, Copy, Debug)]
pub struct FramerOptions {
    pub kind: FramerKind,
    pub layout: HeaderLayout,
    pub max_payload: usize,
}

impl Default for FramerOptions {
    fn default() -> Self {
        Self {
            kind: FramerKind::MultiBuffer,
            layout: HeaderLayout::Basic,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FramerOptions {
    /// Options used by the datagram transports: one buffer per message so
    /// each frame leaves as a single datagram without a gather pass.
    pub fn datagram() -> Self {
        Self {
            kind: FramerKind::SingleBuffer,
            ..Self::default()
        }
    }

    pub fn build(&self) -> Box<dyn Framer> {
        match self.kind {
            FramerKind::MultiBuffer => {
                Box::new(MultiBufferFramer::new(self.layout, self.max_payload))
            }
            FramerKind::SingleBuffer => {
                Box::new(SingleBufferFramer::new(self.layout, self.max_payload))
            }
        }
    }
}

/// Read scheduling, message assembly and outbound encoding.
///
/// The read actor loops: query [`next_op`](Self::next_op), append exactly
/// that many bytes to [`work_buffer`](Self::work_buffer), then call
/// [`advance`](Self::advance). When `advance` returns `true`,
/// [`take`](Self::take) yields the assembled message and resets the state
/// for the next one.
pub trait Framer: Send + Sync {
    fn next_op(&self) -> ReadOp;

    fn work_buffer(&mut self) -> &mut Vec<u8>;

    fn advance(&mut self, n: usize) -> Result<bool, FrameError>;

    fn take(&mut self) -> (Vec<u8>, Channel);

    /// Encode a payload into the ordered buffer sequence written to the
    /// wire. Stateless with respect to the read side.
    fn encode(&self, payload: Vec<u8>, channel: Channel) -> Vec<Bytes>;
}

fn initial_op(layout: HeaderLayout) -> ReadOp {
    match layout {
        HeaderLayout::Basic => ReadOp {
            kind: ReadOpKind::Header,
            len: BASIC_HEADER_LEN,
        },
        HeaderLayout::Extended => ReadOp {
            kind: ReadOpKind::HeaderSize,
            len: 1,
        },
    }
}

fn extended_header(payload_len: u32, channel: Channel) -> [u8; EXTENDED_HEADER_LEN] {
    let mut header = [0u8; EXTENDED_HEADER_LEN];
    header[0] = EXTENDED_HEADER_LEN as u8;
    header[1..5].copy_from_slice(&payload_len.to_le_bytes());
    header[5..13].copy_from_slice(&channel.to_le_bytes());
    header[13..15].copy_from_slice(&0u16.to_le_bytes());
    header
}

fn check_advance(op: ReadOp, n: usize) -> Result<(), FrameError> {
    if n != op.len {
        error!(
            expected = op.len,
            got = n,
            "read actor advanced the framer by the wrong byte count"
        );
        return Err(FrameError::WrongAdvance {
            expected: op.len,
            got: n,
        });
    }
    Ok(())
}

fn check_header_len(declared: usize) -> Result<(), FrameError> {
    if !(EXTENDED_HEADER_LEN..=MAX_HEADER_LEN).contains(&declared) {
        return Err(FrameError::BadHeaderLength(declared));
    }
    Ok(())
}

/// Parse `(payload_len, channel)` out of a completed header buffer.
fn parse_header(layout: HeaderLayout, header: &[u8]) -> (usize, Channel) {
    match layout {
        HeaderLayout::Basic => {
            let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
            (len, 0)
        }
        HeaderLayout::Extended => {
            let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
            let channel = u64::from_le_bytes(header[5..13].try_into().unwrap());
            // The trailing u16 identifier is carried on the wire but has
            // no consumer in this layer.
            (len, channel)
        }
    }
}

/// Header and payload kept in separate buffers; `take` hands out the
/// payload buffer itself.
pub struct MultiBufferFramer {
    layout: HeaderLayout,
    max_payload: usize,
    op: ReadOp,
    header: Vec<u8>,
    payload: Vec<u8>,
    channel: Channel,
}

impl MultiBufferFramer {
    pub fn new(layout: HeaderLayout, max_payload: usize) -> Self {
        Self {
            layout,
            max_payload,
            op: initial_op(layout),
            header: Vec::new(),
            payload: Vec::new(),
            channel: 0,
        }
    }
}

impl Framer for MultiBufferFramer {
    fn next_op(&self) -> ReadOp {
        self.op
    }

    fn work_buffer(&mut self) -> &mut Vec<u8> {
        match self.op.kind {
            ReadOpKind::Payload => &mut self.payload,
            _ => &mut self.header,
        }
    }

    fn advance(&mut self, n: usize) -> Result<bool, FrameError> {
        check_advance(self.op, n)?;
        match self.op.kind {
            ReadOpKind::HeaderSize => {
                let declared = self.header[0] as usize;
                check_header_len(declared)?;
                self.op = ReadOp {
                    kind: ReadOpKind::Header,
                    len: declared - 1,
                };
                Ok(false)
            }
            ReadOpKind::Header => {
                let (len, channel) = parse_header(self.layout, &self.header);
                if len > self.max_payload {
                    return Err(FrameError::OversizedPayload {
                        len,
                        max: self.max_payload,
                    });
                }
                self.header.clear();
                self.channel = channel;
                self.op = ReadOp {
                    kind: ReadOpKind::Payload,
                    len,
                };
                Ok(false)
            }
            ReadOpKind::Payload => {
                self.op = initial_op(self.layout);
                Ok(true)
            }
        }
    }

    fn take(&mut self) -> (Vec<u8>, Channel) {
        (
            std::mem::take(&mut self.payload),
            std::mem::replace(&mut self.channel, 0),
        )
    }

    fn encode(&self, payload: Vec<u8>, channel: Channel) -> Vec<Bytes> {
        let len = payload.len() as u32;
        let header = match self.layout {
            HeaderLayout::Basic => Bytes::copy_from_slice(&len.to_le_bytes()),
            HeaderLayout::Extended => Bytes::copy_from_slice(&extended_header(len, channel)),
        };
        vec![header, Bytes::from(payload)]
    }
}

/// One buffer for header and payload. On assembly the overlapping
/// `min(header_len, payload_len)` bytes at the front and tail are
/// swapped and the buffer truncated, leaving exactly the payload with no
/// second allocation; `encode` performs the inverse reorder.
///
/// The reorder is visible on the wire for payloads longer than the
/// header (the leading payload bytes travel at the end of the frame), so
/// both peers of a connection must use the same framer kind.
pub struct SingleBufferFramer {
    layout: HeaderLayout,
    max_payload: usize,
    op: ReadOp,
    buf: Vec<u8>,
    channel: Channel,
    header_len: usize,
}

impl SingleBufferFramer {
    pub fn new(layout: HeaderLayout, max_payload: usize) -> Self {
        Self {
            layout,
            max_payload,
            op: initial_op(layout),
            buf: Vec::new(),
            channel: 0,
            header_len: match layout {
                HeaderLayout::Basic => BASIC_HEADER_LEN,
                HeaderLayout::Extended => EXTENDED_HEADER_LEN,
            },
        }
    }

    fn swap_overlap(buf: &mut [u8], header_len: usize, payload_len: usize) {
        let copy = header_len.min(payload_len);
        let offset = header_len + payload_len - copy;
        for i in 0..copy {
            buf.swap(i, offset + i);
        }
    }
}

impl Framer for SingleBufferFramer {
    fn next_op(&self) -> ReadOp {
        self.op
    }

    fn work_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    fn advance(&mut self, n: usize) -> Result<bool, FrameError> {
        check_advance(self.op, n)?;
        match self.op.kind {
            ReadOpKind::HeaderSize => {
                let declared = self.buf[0] as usize;
                check_header_len(declared)?;
                self.header_len = declared;
                self.op = ReadOp {
                    kind: ReadOpKind::Header,
                    len: declared - 1,
                };
                Ok(false)
            }
            ReadOpKind::Header => {
                let (len, channel) = parse_header(self.layout, &self.buf);
                if len > self.max_payload {
                    return Err(FrameError::OversizedPayload {
                        len,
                        max: self.max_payload,
                    });
                }
                self.channel = channel;
                self.op = ReadOp {
                    kind: ReadOpKind::Payload,
                    len,
                };
                Ok(false)
            }
            ReadOpKind::Payload => {
                let payload_len = self.op.len;
                Self::swap_overlap(&mut self.buf, self.header_len, payload_len);
                self.buf.truncate(payload_len);
                self.op = initial_op(self.layout);
                Ok(true)
            }
        }
    }

    fn take(&mut self) -> (Vec<u8>, Channel) {
        (
            std::mem::take(&mut self.buf),
            std::mem::replace(&mut self.channel, 0),
        )
    }

    fn encode(&self, payload: Vec<u8>, channel: Channel) -> Vec<Bytes> {
        let payload_len = payload.len();
        let header_len = match self.layout {
            HeaderLayout::Basic => BASIC_HEADER_LEN,
            HeaderLayout::Extended => EXTENDED_HEADER_LEN,
        };
        let mut msg = payload;
        msg.resize(payload_len + header_len, 0);
        Self::swap_overlap(&mut msg, header_len, payload_len);
        match self.layout {
            HeaderLayout::Basic => {
                msg[..4].copy_from_slice(&(payload_len as u32).to_le_bytes());
            }
            HeaderLayout::Extended => {
                msg[..EXTENDED_HEADER_LEN]
                    .copy_from_slice(&extended_header(payload_len as u32, channel));
            }
        }
        vec![Bytes::from(msg)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_bytes(frames: &[Bytes]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend_from_slice(frame);
        }
        out
    }

    /// Run the read schedule over a contiguous byte slice, exactly the
    /// way the read actor does, collecting completed messages.
    fn pump(framer: &mut dyn Framer, wire: &[u8]) -> Vec<(Vec<u8>, Channel)> {
        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            let op = framer.next_op();
            // A zero-length payload op completes without consuming bytes.
            if wire.len() - pos < op.len {
                break;
            }
            let work = framer.work_buffer();
            let offset = work.len();
            work.extend_from_slice(&wire[pos..pos + op.len]);
            assert_eq!(work.len(), offset + op.len);
            pos += op.len;
            if framer.advance(op.len).unwrap() {
                out.push(framer.take());
            }
        }
        out
    }

    fn round_trip(options: FramerOptions, payload: &[u8], channel: Channel) {
        let encoder = options.build();
        let wire = wire_bytes(&encoder.encode(payload.to_vec(), channel));
        let mut decoder = options.build();
        let messages = pump(decoder.as_mut(), &wire);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, payload);
        let expected_channel = match options.layout {
            HeaderLayout::Basic => 0,
            HeaderLayout::Extended => channel,
        };
        assert_eq!(messages[0].1, expected_channel);
    }

    #[test]
    fn multi_buffer_basic_round_trip() {
        round_trip(FramerOptions::default(), b"hello world", 0);
    }

    #[test]
    fn single_buffer_basic_round_trip() {
        let options = FramerOptions {
            kind: FramerKind::SingleBuffer,
            ..FramerOptions::default()
        };
        round_trip(options, b"hello world", 0);
        // Payloads shorter than the header exercise the partial swap.
        round_trip(options, b"ab", 0);
        round_trip(options, b"", 0);
    }

    #[test]
    fn extended_layout_round_trips_the_channel() {
        for kind in [FramerKind::MultiBuffer, FramerKind::SingleBuffer] {
            let options = FramerOptions {
                kind,
                layout: HeaderLayout::Extended,
                ..FramerOptions::default()
            };
            round_trip(options, b"tagged", 0xdead_beef_cafe_f00d);
            round_trip(options, b"abc", 7);
            round_trip(options, b"", 42);
        }
    }

    #[test]
    fn basic_layout_drops_the_channel() {
        let options = FramerOptions::default();
        let encoder = options.build();
        let wire = wire_bytes(&encoder.encode(b"payload".to_vec(), 99));
        let mut decoder = options.build();
        let messages = pump(decoder.as_mut(), &wire);
        assert_eq!(messages[0].1, 0);
    }

    #[test]
    fn back_to_back_messages_keep_their_boundaries() {
        let options = FramerOptions::default();
        let encoder = options.build();
        let mut wire = wire_bytes(&encoder.encode(b"first".to_vec(), 0));
        wire.extend(wire_bytes(&encoder.encode(Vec::new(), 0)));
        wire.extend(wire_bytes(&encoder.encode(b"third".to_vec(), 0)));
        let mut decoder = options.build();
        let messages = pump(decoder.as_mut(), &wire);
        let payloads: Vec<_> = messages.into_iter().map(|(p, _)| p).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), Vec::new(), b"third".to_vec()]);
    }

    #[test]
    fn zero_length_payload_is_a_distinct_message() {
        let options = FramerOptions::default();
        let encoder = options.build();
        let wire = wire_bytes(&encoder.encode(Vec::new(), 0));
        assert_eq!(wire, vec![0, 0, 0, 0]);
        let mut decoder = options.build();
        let messages = pump(decoder.as_mut(), &wire);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].0.is_empty());
    }

    #[test]
    fn payload_at_the_cap_passes_above_it_fails() {
        let options = FramerOptions {
            max_payload: 8,
            ..FramerOptions::default()
        };
        let encoder = options.build();

        let wire = wire_bytes(&encoder.encode(vec![0x41; 8], 0));
        let mut decoder = options.build();
        assert_eq!(pump(decoder.as_mut(), &wire)[0].0.len(), 8);

        let wire = wire_bytes(&encoder.encode(vec![0x41; 9], 0));
        let mut decoder = options.build();
        let work = decoder.work_buffer();
        work.extend_from_slice(&wire[..4]);
        assert_eq!(
            decoder.advance(4),
            Err(FrameError::OversizedPayload { len: 9, max: 8 })
        );
    }

    #[test]
    fn four_gigabyte_header_is_rejected_by_the_default_cap() {
        let mut decoder = FramerOptions::default().build();
        let work = decoder.work_buffer();
        work.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            decoder.advance(4),
            Err(FrameError::OversizedPayload { .. })
        ));
    }

    #[test]
    fn wrong_advance_count_fails_loudly() {
        let mut decoder = FramerOptions::default().build();
        let work = decoder.work_buffer();
        work.extend_from_slice(&[1, 0, 0]);
        assert_eq!(
            decoder.advance(3),
            Err(FrameError::WrongAdvance { expected: 4, got: 3 })
        );
    }

    #[test]
    fn grown_extended_header_is_skipped() {
        // A future revision may enlarge the header; the size byte tells
        // the reader how much to consume before the payload.
        let mut wire = vec![20u8];
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.extend_from_slice(&11u64.to_le_bytes());
        wire.extend_from_slice(&0u16.to_le_bytes());
        wire.extend_from_slice(&[0u8; 5]); // unknown trailing header bytes
        wire.extend_from_slice(b"xyz");

        let options = FramerOptions {
            kind: FramerKind::MultiBuffer,
            layout: HeaderLayout::Extended,
            ..FramerOptions::default()
        };
        let mut decoder = options.build();
        let messages = pump(decoder.as_mut(), &wire);
        assert_eq!(messages, vec![(b"xyz".to_vec(), 11)]);
    }

    #[test]
    fn undersized_extended_header_is_corruption() {
        let options = FramerOptions {
            layout: HeaderLayout::Extended,
            ..FramerOptions::default()
        };
        let mut decoder = options.build();
        let work = decoder.work_buffer();
        work.push(4);
        assert_eq!(decoder.advance(1), Err(FrameError::BadHeaderLength(4)));
    }
}
