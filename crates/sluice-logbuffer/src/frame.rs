//! Frame header layout shared by log buffers and the UDP wire.
//!
//! Every frame starts with a 32-byte little-endian header:
//!
//! ```text
//! 0  frame length   i32   (release-stored last by writers)
//! 4  version        u8
//! 5  flags          u8
//! 6  type           u16
//! 8  term offset    i32
//! 12 session id     i32
//! 16 stream id      i32
//! 20 term id        i32
//! 24 reserved       i64
//! ```

use bitflags::bitflags;

use crate::AtomicBuffer;

pub const HEADER_LENGTH: usize = 32;
pub const FRAME_ALIGNMENT: usize = 32;
pub const CURRENT_VERSION: u8 = 1;

pub const LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_OFFSET: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    Pad = 0x00,
    Data = 0x01,
    Nak = 0x02,
    StatusMessage = 0x03,
    Error = 0x04,
    Setup = 0x05,
    Rtt = 0x06,
    Resolution = 0x07,
}

impl FrameType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x00 => Some(Self::Pad),
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Nak),
            0x03 => Some(Self::StatusMessage),
            0x04 => Some(Self::Error),
            0x05 => Some(Self::Setup),
            0x06 => Some(Self::Rtt),
            0x07 => Some(Self::Resolution),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// First fragment of a message.
        const BEGIN = 0x80;
        /// Last fragment of a message.
        const END = 0x40;
        /// Stream ends at this frame.
        const EOS = 0x20;
    }
}

impl FrameFlags {
    pub const UNFRAGMENTED: FrameFlags = FrameFlags::BEGIN.union(FrameFlags::END);
}

/// On status messages the high flag bit asks the sender to re-send SETUP.
pub const SEND_SETUP_FLAG: u8 = 0x80;

#[inline]
pub fn aligned_length(frame_length: usize) -> usize {
    (frame_length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

#[inline]
pub fn frame_length_volatile(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32_volatile(frame_offset + LENGTH_OFFSET)
}

#[inline]
pub fn frame_length_ordered(buffer: &AtomicBuffer, frame_offset: usize, length: i32) {
    buffer.put_i32_ordered(frame_offset + LENGTH_OFFSET, length);
}

#[inline]
pub fn frame_type(buffer: &AtomicBuffer, frame_offset: usize) -> u16 {
    buffer.get_u16(frame_offset + TYPE_OFFSET)
}

#[inline]
pub fn frame_flags(buffer: &AtomicBuffer, frame_offset: usize) -> FrameFlags {
    FrameFlags::from_bits_retain(buffer.get_u8(frame_offset + FLAGS_OFFSET))
}

#[inline]
pub fn is_padding(buffer: &AtomicBuffer, frame_offset: usize) -> bool {
    frame_type(buffer, frame_offset) == FrameType::Pad as u16
}

#[inline]
pub fn frame_term_offset(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + TERM_OFFSET_OFFSET)
}

#[inline]
pub fn frame_session_id(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + SESSION_ID_OFFSET)
}

#[inline]
pub fn frame_stream_id(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + STREAM_ID_OFFSET)
}

#[inline]
pub fn frame_term_id(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + TERM_ID_OFFSET)
}

/// Write everything except the frame length, which the writer publishes
/// last with release ordering.
#[allow(clippy::too_many_arguments)]
pub fn write_header(
    buffer: &AtomicBuffer,
    frame_offset: usize,
    flags: FrameFlags,
    frame_type: FrameType,
    term_offset: i32,
    session_id: i32,
    stream_id: i32,
    term_id: i32,
) {
    buffer.put_u8(frame_offset + VERSION_OFFSET, CURRENT_VERSION);
    buffer.put_u8(frame_offset + FLAGS_OFFSET, flags.bits());
    buffer.put_u16(frame_offset + TYPE_OFFSET, frame_type as u16);
    buffer.put_i32(frame_offset + TERM_OFFSET_OFFSET, term_offset);
    buffer.put_i32(frame_offset + SESSION_ID_OFFSET, session_id);
    buffer.put_i32(frame_offset + STREAM_ID_OFFSET, stream_id);
    buffer.put_i32(frame_offset + TERM_ID_OFFSET, term_id);
    buffer.put_i64(frame_offset + RESERVED_OFFSET, 0);
}
