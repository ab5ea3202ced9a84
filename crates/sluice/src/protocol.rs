//! Control-frame codecs for the UDP wire. Data and padding frames are
//! transmitted verbatim from the term buffers; these are the out-of-band
//! frames built and parsed at the endpoints. Little-endian throughout,
//! sharing the 8-byte frame prelude (length, version, flags, type).

use sluice_logbuffer::frame::{CURRENT_VERSION, FrameType};

const LENGTH_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 5;
const TYPE_OFFSET: usize = 6;

pub const SETUP_LENGTH: usize = 40;
pub const STATUS_MESSAGE_LENGTH: usize = 36;
pub const STATUS_MESSAGE_WITH_GTAG_LENGTH: usize = 44;
pub const NAK_LENGTH: usize = 28;
pub const RTT_LENGTH: usize = 40;

fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn get_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn write_prelude(buf: &mut [u8], length: usize, flags: u8, frame_type: FrameType) {
    put_i32(buf, LENGTH_OFFSET, length as i32);
    buf[VERSION_OFFSET] = CURRENT_VERSION;
    buf[FLAGS_OFFSET] = flags;
    buf[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&(frame_type as u16).to_le_bytes());
}

/// Type of a well-formed inbound frame, if any. Padding is exempt from the
/// length check: only its header travels, while the declared length covers
/// the whole padded extent.
pub fn classify(buf: &[u8]) -> Option<FrameType> {
    if buf.len() < 8 {
        return None;
    }
    let frame_type = FrameType::from_u16(u16::from_le_bytes([buf[TYPE_OFFSET], buf[TYPE_OFFSET + 1]]))?;
    let declared = get_i32(buf, LENGTH_OFFSET);
    if declared < 0 || (frame_type != FrameType::Pad && declared as usize > buf.len()) {
        return None;
    }
    Some(frame_type)
}

pub fn flags(buf: &[u8]) -> u8 {
    buf[FLAGS_OFFSET]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupMessage {
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_length: i32,
    pub mtu_length: i32,
    pub ttl: i32,
}

impl SetupMessage {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        write_prelude(buf, SETUP_LENGTH, 0, FrameType::Setup);
        put_i32(buf, 8, self.term_offset);
        put_i32(buf, 12, self.session_id);
        put_i32(buf, 16, self.stream_id);
        put_i32(buf, 20, self.initial_term_id);
        put_i32(buf, 24, self.active_term_id);
        put_i32(buf, 28, self.term_length);
        put_i32(buf, 32, self.mtu_length);
        put_i32(buf, 36, self.ttl);
        SETUP_LENGTH
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SETUP_LENGTH {
            return None;
        }
        Some(Self {
            term_offset: get_i32(buf, 8),
            session_id: get_i32(buf, 12),
            stream_id: get_i32(buf, 16),
            initial_term_id: get_i32(buf, 20),
            active_term_id: get_i32(buf, 24),
            term_length: get_i32(buf, 28),
            mtu_length: get_i32(buf, 32),
            ttl: get_i32(buf, 36),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    pub session_id: i32,
    pub stream_id: i32,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window: i32,
    pub receiver_id: i64,
    pub group_tag: Option<i64>,
    pub flags: u8,
}

impl StatusMessage {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let length = if self.group_tag.is_some() {
            STATUS_MESSAGE_WITH_GTAG_LENGTH
        } else {
            STATUS_MESSAGE_LENGTH
        };
        write_prelude(buf, length, self.flags, FrameType::StatusMessage);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.consumption_term_id);
        put_i32(buf, 20, self.consumption_term_offset);
        put_i32(buf, 24, self.receiver_window);
        put_i64(buf, 28, self.receiver_id);
        if let Some(tag) = self.group_tag {
            put_i64(buf, 36, tag);
        }
        length
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < STATUS_MESSAGE_LENGTH {
            return None;
        }
        let group_tag = if buf.len() >= STATUS_MESSAGE_WITH_GTAG_LENGTH {
            Some(get_i64(buf, 36))
        } else {
            None
        };
        Some(Self {
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            consumption_term_id: get_i32(buf, 16),
            consumption_term_offset: get_i32(buf, 20),
            receiver_window: get_i32(buf, 24),
            receiver_id: get_i64(buf, 28),
            group_tag,
            flags: flags(buf),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NakMessage {
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

impl NakMessage {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        write_prelude(buf, NAK_LENGTH, 0, FrameType::Nak);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.term_id);
        put_i32(buf, 20, self.term_offset);
        put_i32(buf, 24, self.length);
        NAK_LENGTH
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < NAK_LENGTH {
            return None;
        }
        Some(Self {
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            term_id: get_i32(buf, 16),
            term_offset: get_i32(buf, 20),
            length: get_i32(buf, 24),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttMeasurement {
    pub session_id: i32,
    pub stream_id: i32,
    pub echo_timestamp_ns: i64,
    pub reception_delay_ns: i64,
    pub receiver_id: i64,
    pub is_reply: bool,
}

impl RttMeasurement {
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let flags = if self.is_reply { crate::protocol::RTT_REPLY } else { 0 };
        write_prelude(buf, RTT_LENGTH, flags, FrameType::Rtt);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i64(buf, 16, self.echo_timestamp_ns);
        put_i64(buf, 24, self.reception_delay_ns);
        put_i64(buf, 32, self.receiver_id);
        RTT_LENGTH
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RTT_LENGTH {
            return None;
        }
        Some(Self {
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            echo_timestamp_ns: get_i64(buf, 16),
            reception_delay_ns: get_i64(buf, 24),
            receiver_id: get_i64(buf, 32),
            is_reply: flags(buf) & RTT_REPLY != 0,
        })
    }
}

pub const RTT_REPLY: u8 = 0x80;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_roundtrip() {
        let msg = SetupMessage {
            term_offset: 1024,
            session_id: 7,
            stream_id: 11,
            initial_term_id: 3,
            active_term_id: 5,
            term_length: 65536,
            mtu_length: 1408,
            ttl: 0,
        };
        let mut buf = [0u8; 64];
        let len = msg.encode(&mut buf);
        assert_eq!(len, SETUP_LENGTH);
        assert_eq!(classify(&buf[..len]), Some(FrameType::Setup));
        assert_eq!(SetupMessage::decode(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn status_message_roundtrip() {
        let mut msg = StatusMessage {
            session_id: 7,
            stream_id: 11,
            consumption_term_id: 2,
            consumption_term_offset: 4096,
            receiver_window: 131_072,
            receiver_id: 0x1122_3344_5566_7788,
            group_tag: None,
            flags: 0,
        };
        let mut buf = [0u8; 64];
        let len = msg.encode(&mut buf);
        assert_eq!(len, STATUS_MESSAGE_LENGTH);
        assert_eq!(StatusMessage::decode(&buf[..len]).unwrap(), msg);

        msg.group_tag = Some(-9);
        let len = msg.encode(&mut buf);
        assert_eq!(len, STATUS_MESSAGE_WITH_GTAG_LENGTH);
        assert_eq!(StatusMessage::decode(&buf[..len]).unwrap().group_tag, Some(-9));
    }

    #[test]
    fn nak_roundtrip() {
        let msg =
            NakMessage { session_id: 1, stream_id: 2, term_id: 2, term_offset: 0, length: 1024 };
        let mut buf = [0u8; 64];
        let len = msg.encode(&mut buf);
        assert_eq!(len, NAK_LENGTH);
        assert_eq!(classify(&buf[..len]), Some(FrameType::Nak));
        assert_eq!(NakMessage::decode(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn rtt_roundtrip() {
        let msg = RttMeasurement {
            session_id: 1,
            stream_id: 2,
            echo_timestamp_ns: 123_456_789,
            reception_delay_ns: 42,
            receiver_id: 9,
            is_reply: true,
        };
        let mut buf = [0u8; 64];
        let len = msg.encode(&mut buf);
        assert_eq!(RttMeasurement::decode(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn classify_rejects_runts() {
        assert_eq!(classify(&[0u8; 4]), None);
        let mut buf = [0u8; 16];
        put_i32(&mut buf, 0, 64); // declared longer than the datagram
        buf[TYPE_OFFSET] = FrameType::Data as u8;
        assert_eq!(classify(&buf), None);
        // padding travels header-only, so its declared length may exceed
        buf[TYPE_OFFSET] = FrameType::Pad as u8;
        assert_eq!(classify(&buf), Some(FrameType::Pad));
    }
}
