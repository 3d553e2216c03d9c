//! In-band reliability frame carried inside every Message box.
//!
//! Wire format (little-endian):
//! ```text
//! +--------+-------------+------------------+--------+----------+----------------+
//! | id (4) | prev id (4) | ack ranges (30)  | status | data pos | data block     |
//! |        |             |                  |  (2)   |   (8)    | (192..1024)    |
//! +--------+-------------+------------------+--------+----------+----------------+
//! ```
//!
//! The ack range block holds six `(delta, span)` pairs with a non-uniform
//! width schedule. The first delta is implicit (always 0), the first span is
//! a `u64`, the second pair is `u32`/`u16` and the remaining four are
//! `u16`/`u16`. A value too large for its field is written as all-ones and
//! the remainder carries into the same field of the next pair.
//!
//! The data block is right-aligned in the smallest bucket of
//! `192, 320, 576, 1024` bytes that fits.

use crate::core::{MAX_ACK_RANGES, MAX_MESSAGE_DATA, MESSAGE_DATA_BUCKETS, MessageError};

use super::interval::{Interval, IntervalSet};

/// Size of the packed ack range block.
pub const RANGE_BLOCK_SIZE: usize = 30;

/// Size of everything before the data block.
pub const FRAME_HEADER_SIZE: usize = 4 + 4 + RANGE_BLOCK_SIZE + 2 + 8;

const STATUS_SUCCESS: u16 = 0x800;
const STATUS_FAILURE: u16 = 0x1000;
const STATUS_LENGTH_MASK: u16 = 0x7ff;

/// Field widths in bytes for each `(delta, span)` pair. A delta width of 0
/// means the delta is not transmitted.
const RANGE_FIELDS: [(usize, usize); MAX_ACK_RANGES] =
    [(0, 8), (4, 2), (2, 2), (2, 2), (2, 2), (2, 2)];

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// The stream ended cleanly.
    Success,
    /// The stream ended with an error.
    Failure,
}

impl Resolution {
    /// Resolution from a `success` flag.
    pub fn from_success(success: bool) -> Self {
        if success {
            Resolution::Success
        } else {
            Resolution::Failure
        }
    }

    /// True for [`Resolution::Success`].
    pub fn is_success(self) -> bool {
        self == Resolution::Success
    }

    fn status_bits(resolution: Option<Self>) -> u16 {
        match resolution {
            None => 0,
            Some(Resolution::Success) => STATUS_SUCCESS,
            Some(Resolution::Failure) => STATUS_FAILURE,
        }
    }
}

/// One reliability frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageFrame {
    /// Sender-chosen message id; 0 marks a pure acknowledgment.
    pub id: u32,
    /// Id of the message this frame acknowledges, 0 for none.
    pub previous_id: u32,
    /// Acknowledged receiver-side ranges, ascending and disjoint.
    pub ranges: Vec<Interval>,
    /// End-of-stream marker.
    pub resolution: Option<Resolution>,
    /// Stream offset of the first data byte, or of the end of the stream
    /// when the frame only carries a resolution.
    pub data_pos: u64,
    /// Stream bytes.
    pub data: Vec<u8>,
}

impl MessageFrame {
    /// A pure acknowledgment of message `previous_id`.
    pub fn ack(previous_id: u32, received: &IntervalSet) -> Self {
        Self {
            previous_id,
            ranges: received.iter().take(MAX_ACK_RANGES).copied().collect(),
            ..Self::default()
        }
    }

    /// True if this frame needs no acknowledgment.
    pub fn is_pure_ack(&self) -> bool {
        self.id == 0
    }

    /// Encode the whole frame.
    pub fn pack(&self) -> Result<Vec<u8>, MessageError> {
        let data = self.pack_data()?;
        let mut out = Vec::with_capacity(8 + RANGE_BLOCK_SIZE + data.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.previous_id.to_le_bytes());
        out.extend_from_slice(&self.pack_ranges()?);
        out.extend_from_slice(&data);
        Ok(out)
    }

    /// Encode the 30-byte ack range block.
    pub fn pack_ranges(&self) -> Result<[u8; RANGE_BLOCK_SIZE], MessageError> {
        let mut ranges: Vec<Interval> = self.ranges.clone();
        if matches!(ranges.first(), Some(first) if first.start != 0) {
            ranges.truncate(MAX_ACK_RANGES - 1);
            ranges.insert(0, Interval::new(0, 0));
        }

        let mut out = [0u8; RANGE_BLOCK_SIZE];
        let mut cursor = 0usize;
        let mut prev = 0u64;
        let mut pending = ranges.into_iter();
        let (mut delta, mut span) = (0u64, 0u64);

        for (delta_width, span_width) in RANGE_FIELDS {
            if delta == 0 && span == 0 {
                let next = pending.next().unwrap_or(Interval::new(prev, prev));
                if next.start < prev {
                    return Err(MessageError::UnsortedRanges);
                }
                delta = next.start - prev;
                span = next.len();
                prev = next.end;
            }
            if delta_width > 0 {
                delta = pack_field(&mut out[cursor..cursor + delta_width], delta);
                cursor += delta_width;
            }
            let field = &mut out[cursor..cursor + span_width];
            if delta == 0 {
                span = pack_field(field, span);
            } else {
                pack_field(field, 0);
            }
            cursor += span_width;
        }
        Ok(out)
    }

    /// Encode status, data position and the padded data block.
    pub fn pack_data(&self) -> Result<Vec<u8>, MessageError> {
        let len = self.data.len();
        let bucket = MESSAGE_DATA_BUCKETS
            .iter()
            .copied()
            .find(|&size| len <= size)
            .ok_or(MessageError::DataTooLong {
                len,
                limit: MAX_MESSAGE_DATA,
            })?;

        // len <= 1024 fits in the 11-bit length field.
        let status = Resolution::status_bits(self.resolution) | len as u16;
        let mut out = Vec::with_capacity(2 + 8 + bucket);
        out.extend_from_slice(&status.to_le_bytes());
        out.extend_from_slice(&self.data_pos.to_le_bytes());
        out.resize(2 + 8 + bucket - len, 0);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Decode a frame.
    pub fn unpack(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(MessageError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let id = read_u32(&bytes[0..4]);
        let previous_id = read_u32(&bytes[4..8]);
        let ranges = unpack_ranges(&bytes[8..8 + RANGE_BLOCK_SIZE])?;

        let status_at = 8 + RANGE_BLOCK_SIZE;
        let status = u16::from_le_bytes([bytes[status_at], bytes[status_at + 1]]);
        let data_pos = read_u64(&bytes[status_at + 2..FRAME_HEADER_SIZE]);

        let resolution = if status & STATUS_SUCCESS != 0 {
            Some(Resolution::Success)
        } else if status & STATUS_FAILURE != 0 {
            Some(Resolution::Failure)
        } else {
            None
        };

        let len = usize::from(status & STATUS_LENGTH_MASK);
        let body = bytes.len() - FRAME_HEADER_SIZE;
        if len > body {
            return Err(MessageError::TooShort {
                expected: FRAME_HEADER_SIZE + len,
                actual: bytes.len(),
            });
        }
        let data = bytes[bytes.len() - len..].to_vec();

        Ok(Self {
            id,
            previous_id,
            ranges,
            resolution,
            data_pos,
            data,
        })
    }
}

/// Write `value` into `field` or, if it does not fit, fill the field with
/// the all-ones sentinel and return what is left over.
fn pack_field(field: &mut [u8], value: u64) -> u64 {
    let max = field_max(field.len());
    if value > max {
        field.fill(0xff);
        value - max
    } else {
        field.copy_from_slice(&value.to_le_bytes()[..field.len()]);
        0
    }
}

fn field_max(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

fn unpack_ranges(block: &[u8]) -> Result<Vec<Interval>, MessageError> {
    let mut set = IntervalSet::new();
    let mut cursor = 0usize;
    let mut end = 0u64;
    for (delta_width, span_width) in RANGE_FIELDS {
        let delta = read_le(&block[cursor..cursor + delta_width]);
        cursor += delta_width;
        let span = read_le(&block[cursor..cursor + span_width]);
        cursor += span_width;

        let start = end.checked_add(delta).ok_or(MessageError::RangeOverflow)?;
        end = start.checked_add(span).ok_or(MessageError::RangeOverflow)?;
        set.insert(Interval::new(start, end));
    }
    Ok(set.as_slice().to_vec())
}

fn read_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    read_le(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn frame_with_ranges(ranges: &[(u64, u64)]) -> MessageFrame {
        MessageFrame {
            ranges: ranges.iter().map(|&r| Interval::from(r)).collect(),
            ..MessageFrame::default()
        }
    }

    #[test]
    fn test_empty_frame_is_202_zero_bytes() {
        let packed = MessageFrame::default().pack_data().unwrap();
        assert_eq!(packed, vec![0u8; 202]);
    }

    #[test]
    fn test_success_status() {
        let frame = MessageFrame {
            resolution: Some(Resolution::Success),
            ..MessageFrame::default()
        };
        let mut expected = vec![0x00, 0x08];
        expected.extend_from_slice(&[0u8; 200]);
        assert_eq!(frame.pack_data().unwrap(), expected);
    }

    #[test]
    fn test_failure_status() {
        let frame = MessageFrame {
            resolution: Some(Resolution::Failure),
            ..MessageFrame::default()
        };
        assert_eq!(&frame.pack_data().unwrap()[..2], &[0x00, 0x10]);
    }

    #[test]
    fn test_data_is_right_aligned() {
        let frame = MessageFrame {
            data: vec![0x01],
            ..MessageFrame::default()
        };
        let mut expected = vec![0x01, 0x00];
        expected.extend_from_slice(&[0u8; 199]);
        expected.push(0x01);
        assert_eq!(frame.pack_data().unwrap(), expected);
    }

    #[rstest]
    #[case(192, "c000", 192)]
    #[case(193, "c100", 320)]
    #[case(576, "4002", 576)]
    #[case(1024, "0004", 1024)]
    fn test_data_buckets(#[case] len: usize, #[case] status: &str, #[case] bucket: usize) {
        let frame = MessageFrame {
            data: vec![0xaa; len],
            ..MessageFrame::default()
        };
        let packed = frame.pack_data().unwrap();
        assert_eq!(hex::encode(&packed[..2]), status);
        assert_eq!(packed.len(), 2 + 8 + bucket);
    }

    #[test]
    fn test_full_data_with_resolution() {
        let success = MessageFrame {
            data: vec![0u8; 1024],
            resolution: Some(Resolution::Success),
            ..MessageFrame::default()
        };
        assert_eq!(hex::encode(&success.pack_data().unwrap()[..2]), "000c");

        let failure = MessageFrame {
            resolution: Some(Resolution::Failure),
            ..success
        };
        assert_eq!(hex::encode(&failure.pack_data().unwrap()[..2]), "0014");
    }

    #[test]
    fn test_data_too_long() {
        let frame = MessageFrame {
            data: vec![0u8; 1025],
            ..MessageFrame::default()
        };
        let err = frame.pack_data().unwrap_err();
        assert_eq!(err, MessageError::DataTooLong { len: 1025, limit: 1024 });
        assert!(frame.pack().is_err());
    }

    #[rstest]
    #[case::empty(&[], "")]
    #[case::single(&[(0, 256)], "0001000000000000")]
    #[case::single_odd(&[(0, 257)], "0101000000000000")]
    #[case::two(&[(0, 256), (512, 1024)], "0001000000000000000100000002")]
    #[case::span_overflow(
        &[(0, 1), (2, 65540)],
        concat!("0100000000000000", "01000000ffff", "00000300")
    )]
    #[case::delta_overflow(
        &[(0, 1), (2, 3), (65540, 65541)],
        concat!("0100000000000000", "010000000100", "ffff0000", "02000100")
    )]
    #[case::chained_span(
        &[(0, 1), (2, 327_676)],
        concat!(
            "0100000000000000",
            "01000000ffff",
            "0000ffff",
            "0000ffff",
            "0000ffff",
            "0000feff"
        )
    )]
    fn test_pack_ranges(#[case] ranges: &[(u64, u64)], #[case] prefix: &str) {
        let packed = frame_with_ranges(ranges).pack_ranges().unwrap();
        let mut expected = hex::decode(prefix).unwrap();
        expected.resize(RANGE_BLOCK_SIZE, 0);
        assert_eq!(hex::encode(packed), hex::encode(expected));
    }

    #[test]
    fn test_first_range_not_at_zero_gets_empty_lead() {
        let frame = frame_with_ranges(&[(10, 20)]);
        let packed = frame.pack_ranges().unwrap();
        // Empty first span, then delta 10 and span 10.
        assert_eq!(&packed[..8], &[0u8; 8]);
        assert_eq!(&packed[8..12], &10u32.to_le_bytes());
        assert_eq!(&packed[12..14], &10u16.to_le_bytes());

        let back = MessageFrame::unpack(&frame.pack().unwrap()).unwrap();
        assert_eq!(back.ranges, vec![Interval::new(10, 20)]);
    }

    #[test]
    fn test_unsorted_ranges_rejected() {
        let frame = frame_with_ranges(&[(0, 10), (5, 20)]);
        assert_eq!(frame.pack_ranges(), Err(MessageError::UnsortedRanges));
    }

    #[rstest]
    #[case(&[])]
    #[case(&[(0, 256), (512, 1024)])]
    #[case(&[(0, 1), (2, 65540)])]
    #[case(&[(0, 1), (2, 3), (65540, 65541)])]
    #[case(&[(0, 1), (2, 327_676)])]
    #[case(&[(0, 1), (3, 4), (6, 7), (9, 10), (12, 13), (15, 16)])]
    fn test_unpack_reverses_pack(#[case] ranges: &[(u64, u64)]) {
        let frame = MessageFrame {
            id: 7,
            previous_id: 3,
            ranges: ranges.iter().map(|&r| Interval::from(r)).collect(),
            resolution: None,
            data_pos: 4096,
            data: b"hello".to_vec(),
        };
        assert_eq!(MessageFrame::unpack(&frame.pack().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_unpack_drops_empty_runs() {
        let mut bytes = vec![0u8; 8];
        let mut block = [0u8; RANGE_BLOCK_SIZE];
        // Second pair: delta 5, span 0.
        block[8..12].copy_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&block);
        bytes.extend_from_slice(&MessageFrame::default().pack_data().unwrap());

        let frame = MessageFrame::unpack(&bytes).unwrap();
        assert!(frame.ranges.is_empty());
    }

    #[test]
    fn test_unpack_rejects_overflowing_ranges() {
        let mut bytes = vec![0u8; 8];
        let mut block = [0u8; RANGE_BLOCK_SIZE];
        block[..8].fill(0xff);
        block[8..12].fill(0xff);
        bytes.extend_from_slice(&block);
        bytes.extend_from_slice(&MessageFrame::default().pack_data().unwrap());

        assert_eq!(MessageFrame::unpack(&bytes), Err(MessageError::RangeOverflow));
    }

    #[test]
    fn test_unpack_too_short() {
        assert!(matches!(
            MessageFrame::unpack(&[0u8; 20]),
            Err(MessageError::TooShort { .. })
        ));

        // Length field larger than the body.
        let mut bytes = vec![0u8; FRAME_HEADER_SIZE + 4];
        bytes[38] = 10;
        assert!(matches!(
            MessageFrame::unpack(&bytes),
            Err(MessageError::TooShort { .. })
        ));
    }

    #[test]
    fn test_ack_frame_takes_first_six_runs() {
        let received = IntervalSet::from_intervals((0..8u64).map(|i| (i * 10, i * 10 + 5)));
        let ack = MessageFrame::ack(9, &received);
        assert!(ack.is_pure_ack());
        assert_eq!(ack.previous_id, 9);
        assert_eq!(ack.ranges.len(), 6);
        assert_eq!(ack.pack().unwrap().len(), 8 + RANGE_BLOCK_SIZE + 202);
    }
}
