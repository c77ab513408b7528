//! Binary frame encoding and decoding.
//!
//! Every record travels as one self-delimiting frame: a big-endian `u32`
//! length prefix covering everything after itself, a fixed header, then a
//! type-specific body. Receivers can frame the byte stream with no external
//! delimiters, and a partial read is resumable because the prefix states how
//! many bytes are still owed.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! u32  length of the remainder
//! u8   record type
//! u32  sequence number
//! u64  timestamp, microseconds since the Unix epoch
//! u64  thread id
//! u16  level
//! tag  u16-prefixed UTF-8, zero length meaning "no tag"
//! body per record type (u32-prefixed text/bytes; width+height for images;
//!      empty for block end)
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::level::Level;
use crate::record::{LogRecord, Payload};

/// Encoded representation of one record, length prefix included.
pub type Frame = Vec<u8>;

/// Record type tags used on the wire.
const TYPE_MESSAGE: u8 = 1;
const TYPE_DATA: u8 = 2;
const TYPE_IMAGE: u8 = 3;
const TYPE_MARKER: u8 = 4;
const TYPE_BLOCK_START: u8 = 5;
const TYPE_BLOCK_END: u8 = 6;

/// Fixed header bytes following the length prefix.
const HEADER_LEN: usize = 1 + 4 + 8 + 8 + 2;

/// Errors produced while encoding a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The encoded frame would exceed the configured maximum size.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Errors produced while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ends before the frame does; retry with more bytes.
    #[error("incomplete frame")]
    Incomplete,
    /// The frame's type tag is not recognised.
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),
    /// The frame's level field is out of range.
    #[error("unknown level value {0}")]
    UnknownLevel(u16),
    /// A length field disagrees with the frame length.
    #[error("inconsistent length field")]
    BadLength,
    /// A text field is not valid UTF-8.
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,
}

/// Encode a record into a self-delimiting frame.
///
/// Pure and total for any well-formed record; the only failure is a frame
/// that would exceed `max_frame_size` bytes overall.
pub fn encode(record: &LogRecord, max_frame_size: usize) -> Result<Frame, EncodeError> {
    let tag_len = record.tag.as_ref().map_or(0, String::len);
    let body_len = HEADER_LEN + 2 + tag_len + record.payload.body_len();
    let total = 4 + body_len;
    if total > max_frame_size {
        return Err(EncodeError::PayloadTooLarge {
            size: total,
            max: max_frame_size,
        });
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend((body_len as u32).to_be_bytes());
    frame.push(record_type(&record.payload));
    frame.extend(record.sequence.to_be_bytes());
    frame.extend(timestamp_micros(record.timestamp).to_be_bytes());
    frame.extend(record.thread_id.to_be_bytes());
    frame.extend(record.level.to_wire().to_be_bytes());

    frame.extend((tag_len as u16).to_be_bytes());
    if let Some(tag) = &record.tag {
        frame.extend_from_slice(tag.as_bytes());
    }

    match &record.payload {
        Payload::Message(text) | Payload::Marker(text) | Payload::BlockStart(text) => {
            frame.extend((text.len() as u32).to_be_bytes());
            frame.extend_from_slice(text.as_bytes());
        }
        Payload::Data(bytes) => {
            frame.extend((bytes.len() as u32).to_be_bytes());
            frame.extend_from_slice(bytes);
        }
        Payload::Image {
            data,
            width,
            height,
        } => {
            frame.extend(width.to_be_bytes());
            frame.extend(height.to_be_bytes());
            frame.extend((data.len() as u32).to_be_bytes());
            frame.extend_from_slice(data);
        }
        Payload::BlockEnd => {}
    }

    debug_assert_eq!(frame.len(), total);
    Ok(frame)
}

/// Decode one frame from the front of `buf`.
///
/// Returns the reconstructed record and the number of bytes consumed, or
/// [`DecodeError::Incomplete`] when `buf` holds only a prefix of the frame.
/// The decoded record's `thread_name` is always `None`: names are not part
/// of the wire header.
pub fn decode(buf: &[u8]) -> Result<(LogRecord, usize), DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Incomplete);
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if body_len < HEADER_LEN + 2 {
        return Err(DecodeError::BadLength);
    }
    let total = 4 + body_len;
    if buf.len() < total {
        return Err(DecodeError::Incomplete);
    }

    let mut cursor = Cursor::new(&buf[4..total]);
    let record_type = cursor.u8()?;
    let sequence = cursor.u32()?;
    let micros = cursor.u64()?;
    let thread_id = cursor.u64()?;
    let level_raw = cursor.u16()?;
    let level = Level::from_wire(level_raw).ok_or(DecodeError::UnknownLevel(level_raw))?;

    let tag_len = cursor.u16()? as usize;
    let tag = if tag_len == 0 {
        None
    } else {
        Some(cursor.utf8(tag_len)?)
    };

    let payload = match record_type {
        TYPE_MESSAGE => Payload::Message(cursor.prefixed_utf8()?),
        TYPE_MARKER => Payload::Marker(cursor.prefixed_utf8()?),
        TYPE_BLOCK_START => Payload::BlockStart(cursor.prefixed_utf8()?),
        TYPE_DATA => Payload::Data(cursor.prefixed_bytes()?),
        TYPE_IMAGE => {
            let width = cursor.u32()?;
            let height = cursor.u32()?;
            let data = cursor.prefixed_bytes()?;
            Payload::Image {
                data,
                width,
                height,
            }
        }
        TYPE_BLOCK_END => Payload::BlockEnd,
        other => return Err(DecodeError::UnknownRecordType(other)),
    };

    if !cursor.is_empty() {
        return Err(DecodeError::BadLength);
    }

    Ok((
        LogRecord {
            sequence,
            timestamp: UNIX_EPOCH + Duration::from_micros(micros),
            thread_id,
            thread_name: None,
            tag,
            level,
            payload,
        },
        total,
    ))
}

fn record_type(payload: &Payload) -> u8 {
    match payload {
        Payload::Message(_) => TYPE_MESSAGE,
        Payload::Data(_) => TYPE_DATA,
        Payload::Image { .. } => TYPE_IMAGE,
        Payload::Marker(_) => TYPE_MARKER,
        Payload::BlockStart(_) => TYPE_BLOCK_START,
        Payload::BlockEnd => TYPE_BLOCK_END,
    }
}

/// Microseconds since the Unix epoch; clocks before the epoch collapse to 0.
fn timestamp_micros(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or_default()
}

/// Bounds-checked reader over a frame body.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::BadLength);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn utf8(&mut self, len: usize) -> Result<String, DecodeError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn prefixed_utf8(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        self.utf8(len)
    }

    fn prefixed_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
