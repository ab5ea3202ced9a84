use std::path::{Path, PathBuf};

use crate::{
    AtomicBuffer,
    descriptor::{self, LOG_META_DATA_LENGTH, PARTITION_COUNT},
    error::LogBufferError,
    frame::{self, FRAME_ALIGNMENT, FrameFlags, FrameType, HEADER_LENGTH},
    region::MappedRegion,
};

/// Outcome of a claim against the active term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Space reserved; write the payload then `commit`.
    Claimed { term_id: i32, term_offset: i32 },
    /// The frame would pass the publisher limit.
    BackPressured,
    /// The term was sealed with padding and the log rotated; retry.
    AdminAction,
}

/// A triple-partitioned append-only log plus one metadata page.
///
/// Exactly one publication owns the write side; subscribers map it
/// read-only. A claimed frame carries its length negated until committed,
/// so readers (and the unblocker) can distinguish in-flight claims from
/// untouched space.
pub struct LogBuffers {
    region: MappedRegion,
    term_length: usize,
    position_bits_to_shift: u32,
    path: Option<PathBuf>,
}

impl LogBuffers {
    pub fn create(path: &Path, term_length: usize) -> Result<Self, LogBufferError> {
        descriptor::check_term_length(term_length)?;
        let region = MappedRegion::create(path, descriptor::log_length(term_length))?;
        Ok(Self::wrap(region, term_length, Some(path.to_path_buf())))
    }

    pub fn create_unshared(term_length: usize) -> Result<Self, LogBufferError> {
        descriptor::check_term_length(term_length)?;
        let region = MappedRegion::heap(descriptor::log_length(term_length));
        Ok(Self::wrap(region, term_length, None))
    }

    pub fn map_existing(path: &Path) -> Result<Self, LogBufferError> {
        let region = MappedRegion::open(path, descriptor::log_length(descriptor::TERM_MIN_LENGTH))?;
        let term_length = (region.len() - LOG_META_DATA_LENGTH) / PARTITION_COUNT;
        descriptor::check_term_length(term_length)?;
        Ok(Self::wrap(region, term_length, Some(path.to_path_buf())))
    }

    fn wrap(region: MappedRegion, term_length: usize, path: Option<PathBuf>) -> Self {
        Self {
            region,
            term_length,
            position_bits_to_shift: descriptor::position_bits_to_shift(term_length),
            path,
        }
    }

    /// Stamp the metadata page for a fresh log.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &self,
        initial_term_id: i32,
        starting_term_id: i32,
        starting_term_offset: i32,
        mtu_length: usize,
        page_size: usize,
        session_id: i32,
        stream_id: i32,
        correlation_id: i64,
    ) {
        let meta = self.meta_buffer();
        meta.put_i32(descriptor::INITIAL_TERM_ID_OFFSET, initial_term_id);
        meta.put_i32(descriptor::MTU_LENGTH_OFFSET, mtu_length as i32);
        meta.put_i32(descriptor::TERM_LENGTH_OFFSET, self.term_length as i32);
        meta.put_i32(descriptor::PAGE_SIZE_OFFSET, page_size as i32);
        meta.put_i32(descriptor::SESSION_ID_OFFSET, session_id);
        meta.put_i32(descriptor::STREAM_ID_OFFSET, stream_id);
        meta.put_i64(descriptor::CORRELATION_ID_OFFSET, correlation_id);
        meta.put_i64_ordered(descriptor::END_OF_STREAM_POSITION_OFFSET, i64::MAX);

        let count = descriptor::term_count(starting_term_id, initial_term_id);
        let index = descriptor::index_by_term_count(count);
        self.set_raw_tail(index, descriptor::pack_tail(starting_term_id, starting_term_offset));
        meta.put_i32(descriptor::ACTIVE_TERM_COUNT_OFFSET, count as i32);
    }

    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    #[inline]
    pub fn position_bits_to_shift(&self) -> u32 {
        self.position_bits_to_shift
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline]
    pub fn term_buffer(&self, index: usize) -> AtomicBuffer {
        self.region.buffer(index * self.term_length, self.term_length)
    }

    #[inline]
    pub fn meta_buffer(&self) -> AtomicBuffer {
        self.region.buffer(PARTITION_COUNT * self.term_length, LOG_META_DATA_LENGTH)
    }

    // --- metadata accessors ---

    #[inline]
    fn tail_offset(index: usize) -> usize {
        descriptor::TERM_TAIL_COUNTERS_OFFSET + index * 8
    }

    #[inline]
    pub fn raw_tail_volatile(&self, index: usize) -> i64 {
        self.meta_buffer().get_i64_volatile(Self::tail_offset(index))
    }

    #[inline]
    fn set_raw_tail(&self, index: usize, value: i64) {
        self.meta_buffer().put_i64_ordered(Self::tail_offset(index), value);
    }

    #[inline]
    fn cas_raw_tail(&self, index: usize, expected: i64, update: i64) -> bool {
        self.meta_buffer().compare_and_set_i64(Self::tail_offset(index), expected, update)
    }

    #[inline]
    pub fn active_term_count(&self) -> i32 {
        self.meta_buffer().get_i32_volatile(descriptor::ACTIVE_TERM_COUNT_OFFSET)
    }

    #[inline]
    fn cas_active_term_count(&self, expected: i32, update: i32) -> bool {
        self.meta_buffer().compare_and_set_i32(descriptor::ACTIVE_TERM_COUNT_OFFSET, expected, update)
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.meta_buffer().get_i32(descriptor::INITIAL_TERM_ID_OFFSET)
    }

    #[inline]
    pub fn mtu_length(&self) -> usize {
        self.meta_buffer().get_i32(descriptor::MTU_LENGTH_OFFSET) as usize
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.meta_buffer().get_i32(descriptor::PAGE_SIZE_OFFSET) as usize
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        self.meta_buffer().get_i32(descriptor::SESSION_ID_OFFSET)
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.meta_buffer().get_i32(descriptor::STREAM_ID_OFFSET)
    }

    #[inline]
    pub fn correlation_id(&self) -> i64 {
        self.meta_buffer().get_i64(descriptor::CORRELATION_ID_OFFSET)
    }

    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        self.meta_buffer().get_i64_volatile(descriptor::END_OF_STREAM_POSITION_OFFSET)
    }

    #[inline]
    pub fn set_end_of_stream_position(&self, position: i64) {
        self.meta_buffer().put_i64_ordered(descriptor::END_OF_STREAM_POSITION_OFFSET, position);
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.meta_buffer().get_i32_volatile(descriptor::IS_CONNECTED_OFFSET) == 1
    }

    #[inline]
    pub fn set_is_connected(&self, connected: bool) {
        self.meta_buffer().put_i32_ordered(descriptor::IS_CONNECTED_OFFSET, i32::from(connected));
    }

    #[inline]
    pub fn active_transport_count(&self) -> i32 {
        self.meta_buffer().get_i32_volatile(descriptor::ACTIVE_TRANSPORT_COUNT_OFFSET)
    }

    #[inline]
    pub fn set_active_transport_count(&self, count: i32) {
        self.meta_buffer().put_i32_ordered(descriptor::ACTIVE_TRANSPORT_COUNT_OFFSET, count);
    }

    #[inline]
    pub fn is_revoked(&self) -> bool {
        self.meta_buffer().get_i32_volatile(descriptor::IS_REVOKED_OFFSET) == 1
    }

    /// Producer-side marker forcing the stream to end at the current
    /// position. Observed by the owning publication on its next time event.
    #[inline]
    pub fn revoke(&self) {
        self.meta_buffer().put_i32_ordered(descriptor::IS_REVOKED_OFFSET, 1);
    }

    /// Position the producer has claimed up to in the active term.
    pub fn producer_position(&self) -> i64 {
        let count = i64::from(self.active_term_count());
        let raw = self.raw_tail_volatile(descriptor::index_by_term_count(count));
        descriptor::compute_position(
            descriptor::term_id_from_tail(raw),
            descriptor::term_offset_from_tail(raw, self.term_length),
            self.position_bits_to_shift,
            self.initial_term_id(),
        )
    }

    // --- appending ---

    /// Reserve space for `length` payload bytes in the active term.
    pub fn claim(
        &self,
        length: usize,
        publisher_limit: i64,
        exclusive: bool,
    ) -> Result<Claim, LogBufferError> {
        let max = descriptor::max_message_length(self.term_length);
        if length > max {
            return Err(LogBufferError::MessageTooLong { length, max });
        }
        let frame_length = length + HEADER_LENGTH;
        let aligned = frame::aligned_length(frame_length) as i64;
        let term_len = self.term_length as i64;
        let initial = self.initial_term_id();

        loop {
            let term_count = self.active_term_count();
            let index = descriptor::index_by_term_count(i64::from(term_count));
            let raw = self.raw_tail_volatile(index);
            let term_id = descriptor::term_id_from_tail(raw);
            let term_offset = i64::from(descriptor::term_offset_from_tail(raw, self.term_length));

            if descriptor::term_count(term_id, initial) != i64::from(term_count) {
                // partition rotated under us, reload
                continue;
            }
            if term_offset >= term_len {
                // sealed by a racing claim; help rotate then retry
                self.rotate_log(term_count, term_id);
                return Ok(Claim::AdminAction);
            }

            let position = descriptor::compute_term_begin_position(
                term_id,
                self.position_bits_to_shift,
                initial,
            ) + term_offset;
            if position + aligned > publisher_limit {
                return Ok(Claim::BackPressured);
            }

            if term_offset + aligned > term_len {
                // seal, pad the remainder and rotate
                if !self.cas_raw_tail(index, raw, descriptor::pack_tail(term_id, term_len as i32)) {
                    continue;
                }
                let pad = term_len - term_offset;
                self.write_padding(index, term_offset as usize, term_id, pad as usize);
                self.rotate_log(term_count, term_id);
                return Ok(Claim::AdminAction);
            }

            if exclusive {
                self.meta_buffer().get_and_add_i64(Self::tail_offset(index), aligned);
            } else if !self.cas_raw_tail(index, raw, raw + aligned) {
                continue;
            }

            let term = self.term_buffer(index);
            let offset = term_offset as usize;
            frame::write_header(
                &term,
                offset,
                FrameFlags::UNFRAGMENTED,
                FrameType::Data,
                term_offset as i32,
                self.session_id(),
                self.stream_id(),
                term_id,
            );
            frame::frame_length_ordered(&term, offset, -(frame_length as i32));
            return Ok(Claim::Claimed { term_id, term_offset: term_offset as i32 });
        }
    }

    /// Publish a claimed frame. Readers see the whole frame or nothing.
    pub fn commit(&self, term_id: i32, term_offset: i32, length: usize) {
        let index = descriptor::index_by_term(self.initial_term_id(), term_id);
        let term = self.term_buffer(index);
        frame::frame_length_ordered(&term, term_offset as usize, (length + HEADER_LENGTH) as i32);
    }

    /// Claim, copy and commit a whole message in one call.
    pub fn append_unfragmented(
        &self,
        payload: &[u8],
        publisher_limit: i64,
        exclusive: bool,
    ) -> Result<Claim, LogBufferError> {
        let claim = self.claim(payload.len(), publisher_limit, exclusive)?;
        if let Claim::Claimed { term_id, term_offset } = claim {
            let index = descriptor::index_by_term(self.initial_term_id(), term_id);
            let term = self.term_buffer(index);
            term.put_bytes(term_offset as usize + HEADER_LENGTH, payload);
            self.commit(term_id, term_offset, payload.len());
        }
        Ok(claim)
    }

    fn write_padding(&self, index: usize, term_offset: usize, term_id: i32, length: usize) {
        let term = self.term_buffer(index);
        frame::write_header(
            &term,
            term_offset,
            FrameFlags::UNFRAGMENTED,
            FrameType::Pad,
            term_offset as i32,
            self.session_id(),
            self.stream_id(),
            term_id,
        );
        frame::frame_length_ordered(&term, term_offset, length as i32);
    }

    fn rotate_log(&self, term_count: i32, term_id: i32) {
        let next_count = term_count.wrapping_add(1);
        let next_index = descriptor::index_by_term_count(i64::from(next_count));
        let next_term_id = term_id.wrapping_add(1);

        let raw = self.raw_tail_volatile(next_index);
        if descriptor::term_id_from_tail(raw) != next_term_id {
            self.cas_raw_tail(next_index, raw, descriptor::pack_tail(next_term_id, 0));
        }
        self.cas_active_term_count(term_count, next_count);
    }

    // --- unblocking ---

    /// Recover a consumer stuck behind a claim whose writer died before
    /// committing. Pads the abandoned extent and reports whether anything
    /// was written.
    pub fn unblock(&self, blocked_position: i64) -> bool {
        let bits = self.position_bits_to_shift;
        let index = descriptor::index_by_position(blocked_position, bits);
        let term_id =
            descriptor::compute_term_id_from_position(blocked_position, bits, self.initial_term_id());
        let raw = self.raw_tail_volatile(index);
        if descriptor::term_id_from_tail(raw) != term_id {
            return false;
        }

        let term = self.term_buffer(index);
        let blocked_offset = descriptor::compute_term_offset_from_position(blocked_position, bits) as usize;
        let tail_offset = descriptor::term_offset_from_tail(raw, self.term_length) as usize;
        let length = frame::frame_length_volatile(&term, blocked_offset);

        if length < 0 {
            // claimed, never committed: the negated length is the exact extent
            let extent = frame::aligned_length((-length) as usize);
            self.write_padding(index, blocked_offset, term_id, extent);
            return true;
        }
        if length == 0 && tail_offset > blocked_offset {
            // tail advanced but no header yet: pad up to the next committed
            // frame, or to the seal point if the term filled
            let mut scan = blocked_offset + FRAME_ALIGNMENT;
            while scan < tail_offset {
                if frame::frame_length_volatile(&term, scan) != 0 {
                    if self.scan_back_confirms_zeroed(&term, scan, blocked_offset) {
                        self.write_padding(index, blocked_offset, term_id, scan - blocked_offset);
                        return true;
                    }
                    return false;
                }
                scan += FRAME_ALIGNMENT;
            }
            if tail_offset == self.term_length
                && frame::frame_length_volatile(&term, blocked_offset) == 0
            {
                self.write_padding(index, blocked_offset, term_id, tail_offset - blocked_offset);
                return true;
            }
        }
        false
    }

    fn scan_back_confirms_zeroed(&self, term: &AtomicBuffer, from: usize, to: usize) -> bool {
        let mut offset = from - FRAME_ALIGNMENT;
        loop {
            if frame::frame_length_volatile(term, offset) != 0 {
                return false;
            }
            if offset == to {
                return true;
            }
            offset -= FRAME_ALIGNMENT;
        }
    }

    // --- cleaning ---

    /// Zero all bytes in `[from_position, to_position)`. Each frame's first
    /// word is written last, release-ordered, so readers never observe a
    /// half-cleaned header.
    pub fn clean_between(&self, from_position: i64, to_position: i64) {
        let bits = self.position_bits_to_shift;
        let mut position = from_position;
        while position < to_position {
            let index = descriptor::index_by_position(position, bits);
            let offset = descriptor::compute_term_offset_from_position(position, bits) as usize;
            let chunk =
                ((to_position - position) as usize).min(self.term_length - offset);
            let term = self.term_buffer(index);
            if chunk > 8 {
                term.set_memory(offset + 8, chunk - 8, 0);
            }
            term.put_i64_ordered(offset, 0);
            position += chunk as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_LENGTH;

    const TERM_LENGTH: usize = 64 * 1024;

    fn new_log() -> LogBuffers {
        let log = LogBuffers::create_unshared(TERM_LENGTH).unwrap();
        log.initialize(0, 0, 0, 1408, 4096, 7, 11, 100);
        log
    }

    fn read_frame(log: &LogBuffers, position: i64) -> (i32, Vec<u8>) {
        let bits = log.position_bits_to_shift();
        let index = descriptor::index_by_position(position, bits);
        let offset = descriptor::compute_term_offset_from_position(position, bits) as usize;
        let term = log.term_buffer(index);
        let frame_length = frame::frame_length_volatile(&term, offset);
        assert!(frame_length > 0, "frame at {position} not committed");
        let payload =
            term.slice(offset + HEADER_LENGTH, frame_length as usize - HEADER_LENGTH).to_vec();
        (frame_length, payload)
    }

    #[test]
    fn framing_roundtrip() {
        let log = new_log();
        let payload = b"hello log buffer".to_vec();

        let claim = log.append_unfragmented(&payload, i64::MAX, true).unwrap();
        assert_eq!(claim, Claim::Claimed { term_id: 0, term_offset: 0 });

        let (frame_length, read) = read_frame(&log, 0);
        assert_eq!(frame_length as usize, payload.len() + HEADER_LENGTH);
        assert_eq!(read, payload);

        let term = log.term_buffer(0);
        assert_eq!(frame::frame_flags(&term, 0), FrameFlags::UNFRAGMENTED);
        assert_eq!(frame::frame_session_id(&term, 0), 7);
        assert_eq!(frame::frame_stream_id(&term, 0), 11);
    }

    #[test]
    fn ten_small_payloads_advance_by_48() {
        let log = new_log();
        let mut expected = 0i64;
        for i in 0..10u8 {
            let claim = log.append_unfragmented(&[i; 16], i64::MAX, true).unwrap();
            let Claim::Claimed { term_id, term_offset } = claim else {
                panic!("unexpected {claim:?}")
            };
            let position = descriptor::compute_position(
                term_id,
                term_offset,
                log.position_bits_to_shift(),
                0,
            );
            assert_eq!(position, expected);
            expected += 48;
        }
        assert_eq!(log.producer_position(), 480);
    }

    #[test]
    fn positions_strictly_increase() {
        let log = new_log();
        let mut last = -1i64;
        for _ in 0..100 {
            match log.append_unfragmented(&[0u8; 100], i64::MAX, false).unwrap() {
                Claim::Claimed { term_id, term_offset } => {
                    let pos = descriptor::compute_position(term_id, term_offset, 16, 0);
                    assert!(pos > last);
                    last = pos;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn pads_at_term_end_and_rotates() {
        let log = new_log();
        // 31 frames of 2048 bytes leave 2048 bytes in the term
        for _ in 0..31 {
            log.append_unfragmented(&[0u8; 2016], i64::MAX, true).unwrap();
        }
        let fill = TERM_LENGTH - 2048;

        // a larger claim cannot fit and seals the term
        let claim = log.append_unfragmented(&[1u8; 2048], i64::MAX, true).unwrap();
        assert_eq!(claim, Claim::AdminAction);

        let term = log.term_buffer(0);
        assert!(frame::is_padding(&term, fill));
        assert_eq!(frame::frame_length_volatile(&term, fill), 2048);

        // next claim lands at offset 0 of term 1
        let claim = log.append_unfragmented(&[1u8; 2048], i64::MAX, true).unwrap();
        assert_eq!(claim, Claim::Claimed { term_id: 1, term_offset: 0 });
        assert_eq!(log.active_term_count(), 1);
    }

    #[test]
    fn back_pressured_past_limit() {
        let log = new_log();
        assert_eq!(log.append_unfragmented(&[0u8; 16], 48, true).unwrap(), Claim::Claimed {
            term_id: 0,
            term_offset: 0
        });
        assert_eq!(
            log.append_unfragmented(&[0u8; 16], 48, true).unwrap(),
            Claim::BackPressured
        );
    }

    #[test]
    fn message_too_long() {
        let log = new_log();
        let max = descriptor::max_message_length(TERM_LENGTH);
        assert!(matches!(
            log.claim(max + 1, i64::MAX, true),
            Err(LogBufferError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn unblocks_abandoned_claim() {
        let log = new_log();
        // claim 256 bytes of term space (224 payload + header) and die
        let claim = log.claim(224, i64::MAX, true).unwrap();
        assert_eq!(claim, Claim::Claimed { term_id: 0, term_offset: 0 });

        assert!(log.unblock(0));
        let term = log.term_buffer(0);
        assert!(frame::is_padding(&term, 0));
        assert_eq!(frame::frame_length_volatile(&term, 0), 256);

        // next frame is readable past the padding
        let claim = log.append_unfragmented(b"after", i64::MAX, true).unwrap();
        assert_eq!(claim, Claim::Claimed { term_id: 0, term_offset: 256 });
    }

    #[test]
    fn unblock_is_noop_for_committed_frames() {
        let log = new_log();
        log.append_unfragmented(b"ok", i64::MAX, true).unwrap();
        assert!(!log.unblock(0));
    }

    #[test]
    fn cleaning_zeroes_below_position() {
        let log = new_log();
        for _ in 0..4 {
            log.append_unfragmented(&[0xAB; 16], i64::MAX, true).unwrap();
        }
        log.clean_between(0, 96);

        let term = log.term_buffer(0);
        for offset in (0..96).step_by(8) {
            assert_eq!(term.get_i64(offset), 0, "byte at {offset} not cleaned");
        }
        // the frame at the clean position is intact
        assert_eq!(frame::frame_length_volatile(&term, 96), 48);
    }

    #[test]
    fn claimed_frame_reads_negative_until_commit() {
        let log = new_log();
        let Claim::Claimed { term_id, term_offset } = log.claim(64, i64::MAX, true).unwrap()
        else {
            panic!()
        };
        let term = log.term_buffer(0);
        assert_eq!(
            frame::frame_length_volatile(&term, 0),
            -((64 + HEADER_LENGTH) as i32)
        );
        log.commit(term_id, term_offset, 64);
        assert_eq!(frame::frame_length_volatile(&term, 0), (64 + HEADER_LENGTH) as i32);
    }

    #[test]
    fn revocation_flag() {
        let log = new_log();
        assert!(!log.is_revoked());
        log.revoke();
        assert!(log.is_revoked());
    }

    #[test]
    fn concurrent_claims_do_not_overlap() {
        let log = std::sync::Arc::new(new_log());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                for _ in 0..200 {
                    loop {
                        match log.append_unfragmented(&[1u8; 32], i64::MAX, false).unwrap() {
                            Claim::Claimed { term_id, term_offset } => {
                                claimed.push(descriptor::compute_position(
                                    term_id,
                                    term_offset,
                                    16,
                                    0,
                                ));
                                break;
                            }
                            Claim::AdminAction => {}
                            Claim::BackPressured => unreachable!(),
                        }
                    }
                }
                claimed
            }));
        }
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800, "claims overlapped");
    }

    #[test]
    fn shared_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.logbuffer");
        let log = LogBuffers::create(&path, TERM_LENGTH).unwrap();
        log.initialize(0, 0, 0, 1408, 4096, 1, 2, 42);
        log.append_unfragmented(b"shared", i64::MAX, true).unwrap();

        let view = LogBuffers::map_existing(&path).unwrap();
        assert_eq!(view.term_length(), TERM_LENGTH);
        assert_eq!(view.correlation_id(), 42);
        let (len, payload) = {
            let term = view.term_buffer(0);
            let len = frame::frame_length_volatile(&term, 0);
            (len, term.slice(HEADER_LENGTH, len as usize - HEADER_LENGTH).to_vec())
        };
        assert_eq!(len as usize, HEADER_LENGTH + 6);
        assert_eq!(payload, b"shared");
    }
}
