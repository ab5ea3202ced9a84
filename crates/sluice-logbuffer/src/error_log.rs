//! Distinct error log: repeated observations of the same error coalesce
//! into one record with a count and first/last timestamps.
//!
//! Record layout (8-byte aligned):
//!
//! ```text
//! 0  length            i32  (release-stored last; whole record)
//! 4  observation count i32  (relaxed add)
//! 8  last observation  i64 ns
//! 16 first observation i64 ns
//! 24 error code        i32
//! 28 message           utf8
//! ```

use sluice_timing::Nanos;

use crate::AtomicBuffer;

const LENGTH_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;
const LAST_TS_OFFSET: usize = 8;
const FIRST_TS_OFFSET: usize = 16;
const CODE_OFFSET: usize = 24;
const MESSAGE_OFFSET: usize = 28;
const RECORD_ALIGNMENT: usize = 8;

pub struct DistinctErrorLog {
    buffer: AtomicBuffer,
    next_offset: usize,
}

impl DistinctErrorLog {
    pub fn new(buffer: AtomicBuffer) -> Self {
        Self { buffer, next_offset: 0 }
    }

    /// Record an observation. Returns false only when the log is out of
    /// space for a new distinct error.
    pub fn record(&mut self, error_code: i32, message: &str, now: Nanos) -> bool {
        let mut offset = 0;
        while offset < self.next_offset {
            let length = self.buffer.get_i32_volatile(offset + LENGTH_OFFSET) as usize;
            let msg_len = length - MESSAGE_OFFSET;
            if self.buffer.get_i32(offset + CODE_OFFSET) == error_code
                && self.buffer.slice(offset + MESSAGE_OFFSET, msg_len) == message.as_bytes()
            {
                self.buffer.put_i64_ordered(offset + LAST_TS_OFFSET, i64::from(now));
                let count = self.buffer.get_i32_volatile(offset + COUNT_OFFSET);
                self.buffer.put_i32_ordered(offset + COUNT_OFFSET, count + 1);
                return true;
            }
            offset += align_up(length);
        }

        let length = MESSAGE_OFFSET + message.len();
        if self.next_offset + align_up(length) > self.buffer.capacity() {
            return false;
        }
        let offset = self.next_offset;
        self.buffer.put_i64(offset + LAST_TS_OFFSET, i64::from(now));
        self.buffer.put_i64(offset + FIRST_TS_OFFSET, i64::from(now));
        self.buffer.put_i32(offset + CODE_OFFSET, error_code);
        self.buffer.put_bytes(offset + MESSAGE_OFFSET, message.as_bytes());
        self.buffer.put_i32(offset + COUNT_OFFSET, 1);
        self.next_offset += align_up(length);
        // record visible to readers only once the length lands
        self.buffer.put_i32_ordered(offset + LENGTH_OFFSET, length as i32);
        true
    }

    /// Walk all published records.
    pub fn for_each(&self, mut f: impl FnMut(i32, i32, Nanos, Nanos, &str)) {
        let mut offset = 0;
        loop {
            if offset + MESSAGE_OFFSET > self.buffer.capacity() {
                return;
            }
            let length = self.buffer.get_i32_volatile(offset + LENGTH_OFFSET) as usize;
            if length == 0 {
                return;
            }
            let code = self.buffer.get_i32(offset + CODE_OFFSET);
            let count = self.buffer.get_i32_volatile(offset + COUNT_OFFSET);
            let last = Nanos(self.buffer.get_i64(offset + LAST_TS_OFFSET) as u64);
            let first = Nanos(self.buffer.get_i64(offset + FIRST_TS_OFFSET) as u64);
            let msg = String::from_utf8_lossy(
                self.buffer.slice(offset + MESSAGE_OFFSET, length - MESSAGE_OFFSET),
            )
            .into_owned();
            f(code, count, first, last, &msg);
            offset += align_up(length);
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
    fn distinct_observations_coalesce() {
        let region = MappedRegion::heap(4096);
        let mut log = DistinctErrorLog::new(region.buffer(0, 4096));

        assert!(log.record(11, "invalid channel", Nanos(100)));
        assert!(log.record(11, "invalid channel", Nanos(200)));
        assert!(log.record(12, "unknown subscription", Nanos(300)));

        let mut seen = Vec::new();
        log.for_each(|code, count, first, last, msg| {
            seen.push((code, count, first, last, msg.to_string()));
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (11, 2, Nanos(100), Nanos(200), "invalid channel".to_string()));
        assert_eq!(seen[1].0, 12);
        assert_eq!(seen[1].1, 1);
    }

    #[test]
    fn out_of_space() {
        let region = MappedRegion::heap(64);
        let mut log = DistinctErrorLog::new(region.buffer(0, 64));
        assert!(log.record(1, "short", Nanos(1)));
        assert!(!log.record(2, "this one does not fit in the remaining space", Nanos(2)));
    }
}
