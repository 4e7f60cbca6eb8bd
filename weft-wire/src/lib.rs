#![deny(unsafe_code)]

//! Wire format for the weft stream multiplexer.
//!
//! Every frame on the wire is a header varint, a length varint, then
//! `length` payload bytes. The header packs a stream id and a 3-bit tag:
//! `(stream_id << 3) | tag`. The tag's low bit records which side of the
//! connection originated the stream, so both peers can key their stream
//! tables without the wire carrying an explicit flag.

use std::fmt;

/// Number of bytes a varint-encoded `u64` can occupy at most.
pub const MAX_VARINT_LEN: usize = 10;

/// Identifies one stream within a session.
///
/// The numeric id alone is not unique: both sides allocate ids starting at
/// zero, so the pair `(id, initiator)` is the key. `initiator` is true iff
/// the local side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub id: u64,
    pub initiator: bool,
}

impl StreamId {
    /// Create a new stream id.
    pub const fn new(id: u64, initiator: bool) -> Self {
        Self { id, initiator }
    }

    /// Build the wire header for a frame sent on this stream.
    pub const fn header(self, tag: Tag) -> Header {
        Header {
            stream_id: self.id,
            tag,
            initiator: self.initiator,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.initiator {
            "initiator"
        } else {
            "receiver"
        };
        write!(f, "stream:{}/{side}", self.id)
    }
}

/// Frame kind, after parity normalisation.
///
/// On the wire, `Message`, `Close` and `Reset` each occupy two adjacent tag
/// values; the even value is used when the frame's sender originated the
/// stream and the odd value when it did not. `NewStream` is only ever sent
/// by the stream's originator, so it has a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    NewStream,
    Message,
    Close,
    Reset,
}

impl Tag {
    /// The even (initiator-side) wire value for this tag.
    pub const fn wire_value(self) -> u64 {
        match self {
            Tag::NewStream => 0,
            Tag::Message => 2,
            Tag::Close => 4,
            Tag::Reset => 6,
        }
    }

    /// Look up a tag by its normalised (even) wire value.
    pub const fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(Tag::NewStream),
            2 => Some(Tag::Message),
            4 => Some(Tag::Close),
            6 => Some(Tag::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::NewStream => "new-stream",
            Tag::Message => "message",
            Tag::Close => "close",
            Tag::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// A decoded frame header.
///
/// `initiator` is relative to the frame's *sender*: true iff the sender
/// originated the stream the frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub stream_id: u64,
    pub tag: Tag,
    pub initiator: bool,
}

impl Header {
    /// Pack this header into its wire representation.
    pub const fn encode(self) -> u64 {
        let mut raw = (self.stream_id << 3) | self.tag.wire_value();
        // Non-initiators use the odd neighbour. NewStream has no odd
        // neighbour; only initiators send it.
        if !self.initiator && !matches!(self.tag, Tag::NewStream) {
            raw -= 1;
        }
        raw
    }

    /// Unpack a wire header.
    ///
    /// Odd tags are normalised to their even neighbour after the sender's
    /// initiator bit has been extracted. Tag 7 has no even neighbour and
    /// is reported as [`HeaderError::UnknownTag`], carrying the stream
    /// coordinates so the caller can still act on the offending stream.
    pub const fn decode(raw: u64) -> Result<Self, HeaderError> {
        let raw_tag = raw & 7;
        let stream_id = raw >> 3;
        let initiator = raw_tag & 1 == 0;
        let normalised = raw_tag + (raw_tag & 1);
        match Tag::from_wire(normalised) {
            Some(tag) => Ok(Header {
                stream_id,
                tag,
                initiator,
            }),
            None => Err(HeaderError::UnknownTag {
                stream_id,
                initiator,
                tag: raw_tag,
            }),
        }
    }
}

/// Error unpacking a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The header carried a tag value outside the recognised set.
    UnknownTag {
        stream_id: u64,
        initiator: bool,
        tag: u64,
    },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::UnknownTag { stream_id, tag, .. } => {
                write!(f, "unknown tag {tag} on stream {stream_id}")
            }
        }
    }
}

impl std::error::Error for HeaderError {}

/// Append `value` to `buf` as an unsigned varint (LEB128).
pub fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push(value as u8 | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes `value` occupies as an unsigned varint.
pub const fn uvarint_len(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

/// Decode an unsigned varint from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn read_uvarint(bytes: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return Err(VarintError::Overflow);
        }
        if b < 0x80 {
            return Ok((value | (b as u64) << shift, i + 1));
        }
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(VarintError::Truncated)
}

/// Error decoding an unsigned varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// The encoding does not fit in a `u64`.
    Overflow,
    /// The input ended mid-varint.
    Truncated,
}

impl fmt::Display for VarintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarintError::Overflow => f.write_str("varint overflows a 64-bit integer"),
            VarintError::Truncated => f.write_str("truncated varint"),
        }
    }
}

impl std::error::Error for VarintError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_initiator_side_tags_even() {
        let id = StreamId::new(0, true);
        assert_eq!(id.header(Tag::NewStream).encode(), 0);
        assert_eq!(id.header(Tag::Message).encode(), 2);
        assert_eq!(id.header(Tag::Close).encode(), 4);
        assert_eq!(id.header(Tag::Reset).encode(), 6);
    }

    #[test]
    fn header_encodes_receiver_side_tags_odd() {
        let id = StreamId::new(3, false);
        assert_eq!(id.header(Tag::Message).encode(), (3 << 3) | 1);
        assert_eq!(id.header(Tag::Close).encode(), (3 << 3) | 3);
        assert_eq!(id.header(Tag::Reset).encode(), (3 << 3) | 5);
    }

    #[test]
    fn header_roundtrip_preserves_stream_and_tag() {
        for initiator in [true, false] {
            for tag in [Tag::Message, Tag::Close, Tag::Reset] {
                for stream_id in [0u64, 1, 7, 8, 12345, u64::MAX >> 3] {
                    let header = Header {
                        stream_id,
                        tag,
                        initiator,
                    };
                    let decoded = Header::decode(header.encode()).unwrap();
                    assert_eq!(decoded, header);
                }
            }
        }
        let ns = Header {
            stream_id: 42,
            tag: Tag::NewStream,
            initiator: true,
        };
        assert_eq!(Header::decode(ns.encode()).unwrap(), ns);
    }

    #[test]
    fn decode_normalises_odd_tags() {
        // 1 -> Message, 3 -> Close, 5 -> Reset, sender not initiator.
        for (raw_tag, tag) in [(1, Tag::Message), (3, Tag::Close), (5, Tag::Reset)] {
            let decoded = Header::decode((9 << 3) | raw_tag).unwrap();
            assert_eq!(decoded.tag, tag);
            assert_eq!(decoded.stream_id, 9);
            assert!(!decoded.initiator);
        }
        // Even values: sender is initiator.
        for (raw_tag, tag) in [(0, Tag::NewStream), (2, Tag::Message), (4, Tag::Close)] {
            let decoded = Header::decode((9 << 3) | raw_tag).unwrap();
            assert_eq!(decoded.tag, tag);
            assert!(decoded.initiator);
        }
    }

    #[test]
    fn decode_rejects_tag_seven() {
        let err = Header::decode((5 << 3) | 7).unwrap_err();
        assert_eq!(
            err,
            HeaderError::UnknownTag {
                stream_id: 5,
                initiator: false,
                tag: 7,
            }
        );
    }

    #[test]
    fn uvarint_golden_vectors() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
            (16384, &[0x80, 0x80, 0x01]),
            (
                u64::MAX,
                &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01],
            ),
        ];
        for (value, bytes) in cases {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, *value);
            assert_eq!(buf, *bytes, "encoding {value}");
            assert_eq!(uvarint_len(*value), bytes.len());
            assert_eq!(read_uvarint(bytes).unwrap(), (*value, bytes.len()));
        }
    }

    #[test]
    fn uvarint_roundtrip() {
        for shift in 0..64 {
            for delta in [-1i64, 0, 1] {
                let value = (1u64 << shift).wrapping_add_signed(delta);
                let mut buf = Vec::new();
                put_uvarint(&mut buf, value);
                let (decoded, consumed) = read_uvarint(&buf).unwrap();
                assert_eq!(decoded, value);
                assert_eq!(consumed, buf.len());
            }
        }
    }

    #[test]
    fn uvarint_decode_stops_at_terminator() {
        // Trailing bytes beyond the varint are left untouched.
        let (value, consumed) = read_uvarint(&[0xac, 0x02, 0xff, 0xff]).unwrap();
        assert_eq!(value, 300);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn uvarint_rejects_overflow() {
        // Eleven continuation bytes can never fit in a u64.
        let encoded = [0x80u8; 11];
        assert_eq!(read_uvarint(&encoded), Err(VarintError::Overflow));
        // Ten bytes whose last byte pushes past 64 bits.
        let mut encoded = vec![0xffu8; 9];
        encoded.push(0x02);
        assert_eq!(read_uvarint(&encoded), Err(VarintError::Overflow));
    }

    #[test]
    fn uvarint_rejects_truncated_input() {
        assert_eq!(read_uvarint(&[]), Err(VarintError::Truncated));
        assert_eq!(read_uvarint(&[0x80]), Err(VarintError::Truncated));
        assert_eq!(read_uvarint(&[0xff, 0xff]), Err(VarintError::Truncated));
    }

    #[test]
    fn stream_id_display_names_the_side() {
        assert_eq!(StreamId::new(4, true).to_string(), "stream:4/initiator");
        assert_eq!(StreamId::new(4, false).to_string(), "stream:4/receiver");
    }
}
