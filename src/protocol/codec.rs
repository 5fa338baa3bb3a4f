//! Scatter/gather wire format.
//!
//! Every read or write travelling between a remote target and the storage
//! server is carried as a single message body laid out as:
//!
//! ```text
//! +--------+------+-------+--------+   +-----+-------+   +-----+-------+
//! | magic  | kind | count | offset |   | len | bytes |...| len | bytes |
//! | u64    | u32  | u32   | u64    |   | u32 |       |   | u32 |       |
//! +--------+------+-------+--------+   +-----+-------+   +-----+-------+
//! ```
//!
//! All integers are little-endian. `count` segments follow the header, each a
//! length prefix and that many raw bytes.
//!
//! [`encode`] never copies payload: the resulting [`Encoded`] holds the header
//! and length prefixes inline and borrows each segment, so the transport can
//! hand the whole list to a vectored write. [`decode`] borrows segments out of
//! the receive buffer (the server path); [`decode_into`] copies them into the
//! caller's destination buffers (the client path).
use std::io::IoSlice;

use thiserror::Error;

pub mod header {
    pub(crate) const MAGIC: u64 = 0x00AB_C123;

    pub(crate) const MAGIC_SIZE: usize = size_of::<u64>();
    pub(crate) const KIND_SIZE: usize = size_of::<u32>();
    pub(crate) const COUNT_SIZE: usize = size_of::<u32>();
    pub(crate) const OFFSET_SIZE: usize = size_of::<u64>();
    pub(crate) const HEADER_SIZE: usize = MAGIC_SIZE + KIND_SIZE + COUNT_SIZE + OFFSET_SIZE;

    pub(crate) const HEADER_MAGIC: usize = 0;
    pub(crate) const HEADER_KIND: usize = HEADER_MAGIC + MAGIC_SIZE;
    pub(crate) const HEADER_COUNT: usize = HEADER_KIND + KIND_SIZE;
    pub(crate) const HEADER_OFFSET: usize = HEADER_COUNT + COUNT_SIZE;

    pub(crate) const SEGMENT_LEN_SIZE: usize = size_of::<u32>();
}

use header::{
    COUNT_SIZE, HEADER_COUNT, HEADER_KIND, HEADER_MAGIC, HEADER_OFFSET, HEADER_SIZE, KIND_SIZE,
    MAGIC, MAGIC_SIZE, OFFSET_SIZE, SEGMENT_LEN_SIZE,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bad magic {found:#x}, message framing is corrupt")]
    BadMagic { found: u64 },
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("expected a {expected:?} message, got {found:?}")]
    UnexpectedKind {
        expected: MessageKind,
        found: MessageKind,
    },
    #[error("message truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("{0} bytes follow the last declared segment")]
    TrailingBytes(usize),
    #[error("message carries {found} segments, {expected} expected")]
    SegmentCount { expected: usize, found: usize },
    #[error("segment {index} is {found} bytes, {expected} expected")]
    SegmentLength {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("segment of {0} bytes does not fit a u32 length prefix")]
    SegmentTooLarge(usize),
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ReadRequest = 1,
    ReadResponse = 2,
    WriteRequest = 3,
    WriteResponse = 4,
}

impl TryFrom<u32> for MessageKind {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::ReadRequest),
            2 => Ok(MessageKind::ReadResponse),
            3 => Ok(MessageKind::WriteRequest),
            4 => Ok(MessageKind::WriteResponse),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub offset: u64,
    pub segments: u32,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0; HEADER_SIZE];
        out[HEADER_MAGIC..HEADER_MAGIC + MAGIC_SIZE].copy_from_slice(&MAGIC.to_le_bytes());
        out[HEADER_KIND..HEADER_KIND + KIND_SIZE]
            .copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[HEADER_COUNT..HEADER_COUNT + COUNT_SIZE]
            .copy_from_slice(&self.segments.to_le_bytes());
        out[HEADER_OFFSET..HEADER_OFFSET + OFFSET_SIZE]
            .copy_from_slice(&self.offset.to_le_bytes());
        out
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = CodecError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: &[u8; HEADER_SIZE] = value
            .get(..HEADER_SIZE)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: value.len(),
            })?;

        let magic = u64::from_le_bytes(field(bytes, HEADER_MAGIC));
        if magic != MAGIC {
            return Err(CodecError::BadMagic { found: magic });
        }

        Ok(Header {
            kind: u32::from_le_bytes(field(bytes, HEADER_KIND)).try_into()?,
            segments: u32::from_le_bytes(field(bytes, HEADER_COUNT)),
            offset: u64::from_le_bytes(field(bytes, HEADER_OFFSET)),
        })
    }
}

fn field<const N: usize>(bytes: &[u8; HEADER_SIZE], at: usize) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// An encoded message as a list of fragments.
#[derive(Debug)]
pub struct Encoded<'a> {
    header: [u8; HEADER_SIZE],
    lengths: Vec<[u8; SEGMENT_LEN_SIZE]>,
    segments: Vec<&'a [u8]>,
}

impl Encoded<'_> {
    /// Fragments in wire order, ready for a vectored write.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(1 + 2 * self.segments.len());
        slices.push(IoSlice::new(&self.header));
        for (len, segment) in self.lengths.iter().zip(&self.segments) {
            slices.push(IoSlice::new(len));
            slices.push(IoSlice::new(segment));
        }
        slices
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + self
                .segments
                .iter()
                .map(|segment| SEGMENT_LEN_SIZE + segment.len())
                .sum::<usize>()
    }

    /// Flattens the fragments into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for slice in self.io_slices() {
            out.extend_from_slice(&slice);
        }
        out
    }
}

pub fn encode<'a, I>(kind: MessageKind, offset: u64, segments: I) -> Result<Encoded<'a>, CodecError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let segments: Vec<&'a [u8]> = segments.into_iter().collect();
    let lengths = segments
        .iter()
        .map(|segment| {
            u32::try_from(segment.len())
                .map(u32::to_le_bytes)
                .map_err(|_| CodecError::SegmentTooLarge(segment.len()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let count = u32::try_from(segments.len())
        .map_err(|_| CodecError::SegmentCount {
            expected: u32::MAX as usize,
            found: segments.len(),
        })?;

    let header = Header {
        kind,
        offset,
        segments: count,
    };
    Ok(Encoded {
        header: header.to_bytes(),
        lengths,
        segments,
    })
}

/// A decoded message whose segments borrow the buffer it was decoded from.
#[derive(Debug, PartialEq, Eq)]
pub struct MessageView<'a> {
    pub header: Header,
    pub segments: Vec<&'a [u8]>,
}

impl MessageView<'_> {
    pub fn expect_kind(&self, expected: MessageKind) -> Result<(), CodecError> {
        if self.header.kind != expected {
            return Err(CodecError::UnexpectedKind {
                expected,
                found: self.header.kind,
            });
        }
        Ok(())
    }

    pub fn payload_len(&self) -> usize {
        self.segments.iter().map(|segment| segment.len()).sum()
    }
}

/// Parses `buf` without copying payload. The declared segment count is walked
/// exactly; running out of bytes early or finding bytes past the last segment
/// are both errors.
pub fn decode(buf: &[u8]) -> Result<MessageView<'_>, CodecError> {
    let header = Header::try_from(buf)?;
    let mut rest = &buf[HEADER_SIZE..];

    let declared = header.segments as usize;
    let mut segments = Vec::with_capacity(declared.min(rest.len() / SEGMENT_LEN_SIZE));
    for _ in 0..declared {
        let len = take(&mut rest, SEGMENT_LEN_SIZE)?;
        let mut prefix = [0; SEGMENT_LEN_SIZE];
        prefix.copy_from_slice(len);
        let len = u32::from_le_bytes(prefix) as usize;

        segments.push(take(&mut rest, len)?);
    }

    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()));
    }

    Ok(MessageView { header, segments })
}

/// Decodes a response of kind `expected`, copying its segments into `dest`.
///
/// With a destination, the response must carry exactly one segment per
/// destination buffer with matching lengths; nothing is copied unless the
/// whole message validates. Without one (write responses) the message is only
/// validated.
pub fn decode_into(
    buf: &[u8],
    expected: MessageKind,
    dest: Option<&mut [Vec<u8>]>,
) -> Result<Header, CodecError> {
    let view = decode(buf)?;
    view.expect_kind(expected)?;

    let Some(dest) = dest else {
        return Ok(view.header);
    };

    if view.segments.len() != dest.len() {
        return Err(CodecError::SegmentCount {
            expected: dest.len(),
            found: view.segments.len(),
        });
    }
    for (index, (segment, target)) in view.segments.iter().zip(dest.iter()).enumerate() {
        if segment.len() != target.len() {
            return Err(CodecError::SegmentLength {
                index,
                expected: target.len(),
                found: segment.len(),
            });
        }
    }

    for (segment, target) in view.segments.iter().zip(dest.iter_mut()) {
        target.copy_from_slice(segment);
    }
    Ok(view.header)
}

fn take<'a>(rest: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if rest.len() < len {
        return Err(CodecError::Truncated {
            needed: len,
            available: rest.len(),
        });
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Vec<u8>> {
        vec![vec![0x11; 3], vec![], vec![0x22; 700], vec![0x33; 1]]
    }

    #[test]
    fn decode_reproduces_encode() {
        let segments = sample();
        let encoded = encode(
            MessageKind::WriteRequest,
            4096,
            segments.iter().map(Vec::as_slice),
        )
        .unwrap();
        let bytes = encoded.to_vec();
        assert_eq!(bytes.len(), encoded.encoded_len());

        let view = decode(&bytes).unwrap();
        assert_eq!(
            view.header,
            Header {
                kind: MessageKind::WriteRequest,
                offset: 4096,
                segments: 4
            }
        );
        assert_eq!(view.segments, segments.iter().map(Vec::as_slice).collect::<Vec<_>>());
        assert_eq!(view.payload_len(), 704);
    }

    #[test]
    fn fragments_borrow_segments() {
        let segments = sample();
        let encoded = encode(
            MessageKind::ReadResponse,
            0,
            segments.iter().map(Vec::as_slice),
        )
        .unwrap();
        let slices = encoded.io_slices();

        assert_eq!(slices.len(), 1 + 2 * segments.len());
        assert_eq!(slices[0].len(), HEADER_SIZE);
        assert_eq!(slices[6].as_ptr(), segments[2].as_ptr());
    }

    #[test]
    fn decode_borrows_receive_buffer() {
        let payload = vec![7_u8; 32];
        let bytes = encode(MessageKind::WriteRequest, 0, [payload.as_slice()])
            .unwrap()
            .to_vec();

        let view = decode(&bytes).unwrap();
        let start = bytes.as_ptr() as usize + HEADER_SIZE + SEGMENT_LEN_SIZE;
        assert_eq!(view.segments[0].as_ptr() as usize, start);
    }

    #[test]
    fn empty_message() {
        let bytes = encode(MessageKind::WriteResponse, 0, []).unwrap().to_vec();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let view = decode(&bytes).unwrap();
        assert_eq!(view.header.segments, 0);
        assert!(view.segments.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode(MessageKind::ReadRequest, 0, [&[1_u8; 8][..]])
            .unwrap()
            .to_vec();
        bytes[HEADER_MAGIC] ^= 0xFF;

        assert!(matches!(decode(&bytes), Err(CodecError::BadMagic { .. })));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = encode(MessageKind::ReadRequest, 0, []).unwrap().to_vec();
        bytes[HEADER_KIND..HEADER_KIND + KIND_SIZE].copy_from_slice(&9_u32.to_le_bytes());

        assert_eq!(decode(&bytes), Err(CodecError::UnknownKind(9)));
    }

    #[test]
    fn short_header_is_truncated() {
        let bytes = encode(MessageKind::ReadRequest, 0, []).unwrap().to_vec();

        assert_eq!(
            decode(&bytes[..10]),
            Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: 10
            })
        );
    }

    #[test]
    fn overstated_segment_count_is_rejected() {
        let mut bytes = encode(MessageKind::WriteRequest, 0, [&[5_u8; 4][..]])
            .unwrap()
            .to_vec();
        bytes[HEADER_COUNT..HEADER_COUNT + COUNT_SIZE].copy_from_slice(&1000_u32.to_le_bytes());

        assert!(matches!(decode(&bytes), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn understated_segment_count_is_rejected() {
        let mut bytes = encode(MessageKind::WriteRequest, 0, [&[5_u8; 4][..], &[6_u8; 4][..]])
            .unwrap()
            .to_vec();
        bytes[HEADER_COUNT..HEADER_COUNT + COUNT_SIZE].copy_from_slice(&1_u32.to_le_bytes());

        assert_eq!(
            decode(&bytes),
            Err(CodecError::TrailingBytes(SEGMENT_LEN_SIZE + 4))
        );
    }

    #[test]
    fn segment_length_past_end_is_rejected() {
        let mut bytes = encode(MessageKind::WriteRequest, 0, [&[5_u8; 4][..]])
            .unwrap()
            .to_vec();
        bytes[HEADER_SIZE..HEADER_SIZE + SEGMENT_LEN_SIZE]
            .copy_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(decode(&bytes), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn decode_into_copies_payload() {
        let bytes = encode(
            MessageKind::ReadResponse,
            512,
            [&[1_u8; 2][..], &[2_u8; 6][..]],
        )
        .unwrap()
        .to_vec();
        let mut dest = vec![vec![0; 2], vec![0; 6]];

        let header = decode_into(&bytes, MessageKind::ReadResponse, Some(&mut dest)).unwrap();
        assert_eq!(header.offset, 512);
        assert_eq!(dest, vec![vec![1; 2], vec![2; 6]]);
    }

    #[test]
    fn decode_into_without_destination_only_validates() {
        let bytes = encode(MessageKind::WriteResponse, 0, []).unwrap().to_vec();
        assert!(decode_into(&bytes, MessageKind::WriteResponse, None).is_ok());

        assert_eq!(
            decode_into(&bytes, MessageKind::ReadResponse, None),
            Err(CodecError::UnexpectedKind {
                expected: MessageKind::ReadResponse,
                found: MessageKind::WriteResponse
            })
        );
    }

    #[test]
    fn decode_into_leaves_destination_untouched_on_mismatch() {
        let bytes = encode(
            MessageKind::ReadResponse,
            0,
            [&[1_u8; 4][..], &[2_u8; 3][..]],
        )
        .unwrap()
        .to_vec();
        let mut dest = vec![vec![0; 4], vec![0; 4]];

        assert_eq!(
            decode_into(&bytes, MessageKind::ReadResponse, Some(&mut dest)),
            Err(CodecError::SegmentLength {
                index: 1,
                expected: 4,
                found: 3
            })
        );
        assert_eq!(dest, vec![vec![0; 4], vec![0; 4]]);
    }
}
