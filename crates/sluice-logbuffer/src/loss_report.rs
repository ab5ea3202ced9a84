//! Loss report: one record per (session, stream, channel, source) that has
//! observed gap loss, updated in place as more loss is attributed to it.
//!
//! Record layout (8-byte aligned):
//!
//! ```text
//! 0  observation count i64
//! 8  total bytes lost  i64
//! 16 first observation i64 ns
//! 24 last observation  i64 ns
//! 32 session id        i32
//! 36 stream id         i32
//! 40 channel length    i32  (release-stored last)
//! 44 channel utf8, then source length i32 + source utf8
//! ```

use sluice_timing::Nanos;

use crate::AtomicBuffer;

const OBSERVATION_COUNT_OFFSET: usize = 0;
const TOTAL_BYTES_OFFSET: usize = 8;
const FIRST_TS_OFFSET: usize = 16;
const LAST_TS_OFFSET: usize = 24;
const SESSION_ID_OFFSET: usize = 32;
const STREAM_ID_OFFSET: usize = 36;
const CHANNEL_LENGTH_OFFSET: usize = 40;
const CHANNEL_OFFSET: usize = 44;
const RECORD_ALIGNMENT: usize = 8;

/// Handle to one record, returned at creation so the image can update it
/// without re-scanning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LossEntry(usize);

pub struct LossReport {
    buffer: AtomicBuffer,
    next_offset: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct LossObservation {
    pub observation_count: i64,
    pub total_bytes_lost: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub source: String,
}

impl LossReport {
    pub fn new(buffer: AtomicBuffer) -> Self {
        Self { buffer, next_offset: 0 }
    }

    pub fn create_entry(
        &mut self,
        initial_bytes_lost: i64,
        now: Nanos,
        session_id: i32,
        stream_id: i32,
        channel: &str,
        source: &str,
    ) -> Option<LossEntry> {
        let length = CHANNEL_OFFSET + channel.len() + 4 + source.len();
        if self.next_offset + align_up(length) > self.buffer.capacity() {
            return None;
        }
        let offset = self.next_offset;
        self.buffer.put_i64(offset + OBSERVATION_COUNT_OFFSET, 1);
        self.buffer.put_i64(offset + TOTAL_BYTES_OFFSET, initial_bytes_lost);
        self.buffer.put_i64(offset + FIRST_TS_OFFSET, i64::from(now));
        self.buffer.put_i64(offset + LAST_TS_OFFSET, i64::from(now));
        self.buffer.put_i32(offset + SESSION_ID_OFFSET, session_id);
        self.buffer.put_i32(offset + STREAM_ID_OFFSET, stream_id);
        self.buffer.put_bytes(offset + CHANNEL_OFFSET, channel.as_bytes());
        self.buffer
            .put_i32(offset + CHANNEL_OFFSET + channel.len(), source.len() as i32);
        self.buffer.put_bytes(offset + CHANNEL_OFFSET + channel.len() + 4, source.as_bytes());
        self.next_offset += align_up(length);
        self.buffer.put_i32_ordered(offset + CHANNEL_LENGTH_OFFSET, channel.len() as i32);
        Some(LossEntry(offset))
    }

    pub fn record_observation(&mut self, entry: LossEntry, bytes_lost: i64, now: Nanos) {
        let offset = entry.0;
        self.buffer.put_i64_ordered(offset + LAST_TS_OFFSET, i64::from(now));
        self.buffer.add_i64_ordered(offset + TOTAL_BYTES_OFFSET, bytes_lost);
        self.buffer.add_i64_ordered(offset + OBSERVATION_COUNT_OFFSET, 1);
    }

    pub fn for_each(&self, mut f: impl FnMut(&LossObservation)) {
        let mut offset = 0;
        while offset + CHANNEL_OFFSET <= self.buffer.capacity() {
            let channel_len = self.buffer.get_i32_volatile(offset + CHANNEL_LENGTH_OFFSET);
            if channel_len == 0 && self.buffer.get_i64(offset + OBSERVATION_COUNT_OFFSET) == 0 {
                return;
            }
            let channel_len = channel_len as usize;
            let source_len =
                self.buffer.get_i32(offset + CHANNEL_OFFSET + channel_len) as usize;
            let observation = LossObservation {
                observation_count: self.buffer.get_i64_volatile(offset + OBSERVATION_COUNT_OFFSET),
                total_bytes_lost: self.buffer.get_i64_volatile(offset + TOTAL_BYTES_OFFSET),
                session_id: self.buffer.get_i32(offset + SESSION_ID_OFFSET),
                stream_id: self.buffer.get_i32(offset + STREAM_ID_OFFSET),
                channel: String::from_utf8_lossy(
                    self.buffer.slice(offset + CHANNEL_OFFSET, channel_len),
                )
                .into_owned(),
                source: String::from_utf8_lossy(
                    self.buffer.slice(offset + CHANNEL_OFFSET + channel_len + 4, source_len),
                )
                .into_owned(),
            };
            f(&observation);
            offset += align_up(CHANNEL_OFFSET + channel_len + 4 + source_len);
        }
    }
}

#[inline]
fn align_up(length: usize) -> usize {
    (length + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MappedRegion;

    #[test]
    fn create_then_update() {
        let region = MappedRegion::heap(1024);
        let mut report = LossReport::new(region.buffer(0, 1024));

        let entry = report
            .create_entry(1024, Nanos(5), 7, 11, "sluice:udp?endpoint=host:40123", "10.0.0.2:54321")
            .unwrap();
        report.record_observation(entry, 512, Nanos(9));

        let mut seen = Vec::new();
        report.for_each(|o| {
            seen.push(LossObservation {
                observation_count: o.observation_count,
                total_bytes_lost: o.total_bytes_lost,
                session_id: o.session_id,
                stream_id: o.stream_id,
                channel: o.channel.clone(),
                source: o.source.clone(),
            });
        });
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].observation_count, 2);
        assert_eq!(seen[0].total_bytes_lost, 1536);
        assert_eq!(seen[0].session_id, 7);
        assert_eq!(seen[0].channel, "sluice:udp?endpoint=host:40123");
        assert_eq!(seen[0].source, "10.0.0.2:54321");
    }

    #[test]
    fn fills_up() {
        let region = MappedRegion::heap(64);
        let mut report = LossReport::new(region.buffer(0, 64));
        assert!(report.create_entry(1, Nanos(1), 1, 1, "c", "s").is_some());
        assert!(report.create_entry(1, Nanos(1), 1, 1, "c2", "s2").is_none());
    }
}
