//! Byte-level layer of the Ember save/resync archive format.
//!
//! Every archived scripting value is one tag byte followed by a payload.
//! The same stream is consumed for save games and for lockstep
//! resynchronization, so the encoding must be byte-for-byte identical
//! across independently-running processes: all multi-byte payloads are
//! little-endian, integers are narrowed deterministically, and strings
//! carry an explicit length so embedded zero bytes survive.

use bytes::Buf;
use thiserror::Error;

/// Longest string that fits the one-byte length prefix.
pub const SMALL_STRING_MAX: usize = 254;

/// Tag byte prefixed to every archived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Null = 0x00,
    True = 0x01,
    False = 0x02,
    Int8 = 0x03,
    Int16 = 0x04,
    Int32 = 0x05,
    SmallString = 0x06,
    LargeString = 0x07,
    TableRef = 0x08,

    Actor = 0x10,
    Player = 0x11,
    Line = 0x12,
    Sector = 0x13,
    Side = 0x14,
    Vertex = 0x15,

    Vec2 = 0x20,
    Vec3 = 0x21,
    Matrix = 0x22,
    Quaternion = 0x23,

    /// Marks the end of a table body during table serialization.
    End = 0xFF,
}

impl TryFrom<u8> for Tag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0x00 => Self::Null,
            0x01 => Self::True,
            0x02 => Self::False,
            0x03 => Self::Int8,
            0x04 => Self::Int16,
            0x05 => Self::Int32,
            0x06 => Self::SmallString,
            0x07 => Self::LargeString,
            0x08 => Self::TableRef,
            0x10 => Self::Actor,
            0x11 => Self::Player,
            0x12 => Self::Line,
            0x13 => Self::Sector,
            0x14 => Self::Side,
            0x15 => Self::Vertex,
            0x20 => Self::Vec2,
            0x21 => Self::Vec3,
            0x22 => Self::Matrix,
            0x23 => Self::Quaternion,
            0xFF => Self::End,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// Error conditions raised by the stream primitives.
///
/// Either one is fatal to the archival operation that hit it; the
/// higher layers never resynchronize a damaged stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("archive stream ended mid-record")]
    Truncated,
    #[error("archive tag {0:#04x} is unknown")]
    UnknownTag(u8),
}

/// Accumulates one archive operation's bytes.
#[derive(Debug, Default)]
pub struct StreamWriter {
    buf: Vec<u8>,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_tag(&mut self, tag: Tag) {
        self.buf.push(tag as u8);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.push(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put_u32(value.to_bits());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes an integer under the narrowest of the three integer tags
    /// that round-trips it losslessly.
    pub fn put_int(&mut self, value: i32) {
        if let Ok(narrow) = i8::try_from(value) {
            self.put_tag(Tag::Int8);
            self.put_i8(narrow);
        } else if let Ok(narrow) = i16::try_from(value) {
            self.put_tag(Tag::Int16);
            self.put_i16(narrow);
        } else {
            self.put_tag(Tag::Int32);
            self.put_i32(value);
        }
    }

    /// Writes a string tag, length prefix, and the raw bytes. Embedded
    /// zero bytes are preserved; nothing is NUL-terminated on the wire.
    pub fn put_str(&mut self, bytes: &[u8]) {
        if bytes.len() <= SMALL_STRING_MAX {
            self.put_tag(Tag::SmallString);
            self.put_u8(bytes.len() as u8);
        } else {
            self.put_tag(Tag::LargeString);
            self.put_u32(bytes.len() as u32);
        }
        self.put_bytes(bytes);
    }
}

/// Reads one archive operation's bytes back out.
#[derive(Debug)]
pub struct StreamReader<'a> {
    rest: &'a [u8],
}

impl<'a> StreamReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    fn need(&self, len: usize) -> Result<(), CodecError> {
        if self.rest.remaining() < len {
            return Err(CodecError::Truncated);
        }
        Ok(())
    }

    pub fn take_tag(&mut self) -> Result<Tag, CodecError> {
        Tag::try_from(self.take_u8()?)
    }

    pub fn take_u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.rest.get_u8())
    }

    pub fn take_i8(&mut self) -> Result<i8, CodecError> {
        self.need(1)?;
        Ok(self.rest.get_i8())
    }

    pub fn take_u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.rest.get_u16_le())
    }

    pub fn take_i16(&mut self) -> Result<i16, CodecError> {
        self.need(2)?;
        Ok(self.rest.get_i16_le())
    }

    pub fn take_u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.rest.get_u32_le())
    }

    pub fn take_i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.rest.get_i32_le())
    }

    pub fn take_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.take_u32()?))
    }

    pub fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.need(len)?;
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    /// Reads the payload of an integer tag back to full width.
    pub fn take_int(&mut self, tag: Tag) -> Result<i32, CodecError> {
        match tag {
            Tag::Int8 => Ok(i32::from(self.take_i8()?)),
            Tag::Int16 => Ok(i32::from(self.take_i16()?)),
            Tag::Int32 => self.take_i32(),
            other => Err(CodecError::UnknownTag(other as u8)),
        }
    }

    /// Reads the payload of a string tag.
    pub fn take_str(&mut self, tag: Tag) -> Result<&'a [u8], CodecError> {
        let len = match tag {
            Tag::SmallString => usize::from(self.take_u8()?),
            Tag::LargeString => self.take_u32()? as usize,
            other => return Err(CodecError::UnknownTag(other as u8)),
        };
        self.take_bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecError, StreamReader, StreamWriter, Tag, SMALL_STRING_MAX};

    fn round_trip_int(value: i32, expected_tag: Tag) {
        let mut writer = StreamWriter::new();
        writer.put_int(value);
        let bytes = writer.into_bytes();
        let mut reader = StreamReader::new(&bytes);
        let tag = reader.take_tag().expect("tag");
        assert_eq!(tag, expected_tag, "tag for {value}");
        assert_eq!(reader.take_int(tag).expect("payload"), value);
        assert_eq!(reader.remaining(), 0, "trailing bytes for {value}");
    }

    #[test]
    fn integers_use_the_narrowest_width() {
        round_trip_int(0, Tag::Int8);
        round_trip_int(i32::from(i8::MAX), Tag::Int8);
        round_trip_int(i32::from(i8::MIN), Tag::Int8);
        round_trip_int(i32::from(i8::MAX) + 1, Tag::Int16);
        round_trip_int(i32::from(i8::MIN) - 1, Tag::Int16);
        round_trip_int(i32::from(i16::MAX), Tag::Int16);
        round_trip_int(i32::from(i16::MIN), Tag::Int16);
        round_trip_int(i32::from(i16::MAX) + 1, Tag::Int32);
        round_trip_int(i32::from(i16::MIN) - 1, Tag::Int32);
        round_trip_int(i32::MAX, Tag::Int32);
        round_trip_int(i32::MIN, Tag::Int32);
    }

    #[test]
    fn strings_keep_embedded_zeros() {
        let mut writer = StreamWriter::new();
        writer.put_str(b"fox\0hound");
        let bytes = writer.into_bytes();
        let mut reader = StreamReader::new(&bytes);
        let tag = reader.take_tag().expect("tag");
        assert_eq!(tag, Tag::SmallString);
        assert_eq!(reader.take_str(tag).expect("payload"), b"fox\0hound");
    }

    #[test]
    fn string_length_prefix_widens_past_the_small_limit() {
        let small = vec![b'x'; SMALL_STRING_MAX];
        let large = vec![b'y'; SMALL_STRING_MAX + 1];

        let mut writer = StreamWriter::new();
        writer.put_str(&small);
        writer.put_str(&large);
        let bytes = writer.into_bytes();

        let mut reader = StreamReader::new(&bytes);
        let tag = reader.take_tag().expect("small tag");
        assert_eq!(tag, Tag::SmallString);
        assert_eq!(reader.take_str(tag).expect("small payload"), &small[..]);
        let tag = reader.take_tag().expect("large tag");
        assert_eq!(tag, Tag::LargeString);
        assert_eq!(reader.take_str(tag).expect("large payload"), &large[..]);
    }

    #[test]
    fn truncated_streams_are_rejected() {
        let mut writer = StreamWriter::new();
        writer.put_str(b"truncate me");
        let bytes = writer.into_bytes();

        let mut reader = StreamReader::new(&bytes[..bytes.len() - 1]);
        let tag = reader.take_tag().expect("tag");
        assert!(matches!(reader.take_str(tag), Err(CodecError::Truncated)));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut reader = StreamReader::new(&[0x7E]);
        assert!(matches!(
            reader.take_tag(),
            Err(CodecError::UnknownTag(0x7E))
        ));
    }

    #[test]
    fn floats_round_trip_bit_exactly() {
        let mut writer = StreamWriter::new();
        writer.put_f32(-0.0);
        writer.put_f32(1.5);
        writer.put_f32(f32::MIN_POSITIVE);
        let bytes = writer.into_bytes();
        let mut reader = StreamReader::new(&bytes);
        assert_eq!(reader.take_f32().expect("a").to_bits(), (-0.0f32).to_bits());
        assert_eq!(reader.take_f32().expect("b"), 1.5);
        assert_eq!(reader.take_f32().expect("c"), f32::MIN_POSITIVE);
    }
}
