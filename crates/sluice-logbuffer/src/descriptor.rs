//! Layout of a log buffer and the position arithmetic over it.
//!
//! A log is three term buffers of equal power-of-two length followed by one
//! metadata page. Exactly one partition is active at a time; the stream
//! position is a bijection of `(termId, termOffset)` given the initial term
//! id and the term length.

use crate::error::LogBufferError;

pub const PARTITION_COUNT: usize = 3;
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;
pub const PAGE_MIN_SIZE: usize = 4 * 1024;
pub const PAGE_MAX_SIZE: usize = 1024 * 1024 * 1024;
pub const MAX_SINGLE_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

/// Metadata page, laid out after the three terms.
pub const LOG_META_DATA_LENGTH: usize = 4096;

pub const TERM_TAIL_COUNTERS_OFFSET: usize = 0; // 3 x i64
pub const ACTIVE_TERM_COUNT_OFFSET: usize = 24;
pub const END_OF_STREAM_POSITION_OFFSET: usize = 32;
pub const IS_CONNECTED_OFFSET: usize = 40;
pub const ACTIVE_TRANSPORT_COUNT_OFFSET: usize = 44;
pub const CORRELATION_ID_OFFSET: usize = 48;
pub const INITIAL_TERM_ID_OFFSET: usize = 56;
pub const MTU_LENGTH_OFFSET: usize = 60;
pub const TERM_LENGTH_OFFSET: usize = 64;
pub const PAGE_SIZE_OFFSET: usize = 68;
pub const IS_REVOKED_OFFSET: usize = 72;
pub const SESSION_ID_OFFSET: usize = 76;
pub const STREAM_ID_OFFSET: usize = 80;

pub fn check_term_length(term_length: usize) -> Result<(), LogBufferError> {
    if !term_length.is_power_of_two()
        || !(TERM_MIN_LENGTH..=TERM_MAX_LENGTH).contains(&term_length)
    {
        return Err(LogBufferError::InvalidTermLength(term_length));
    }
    Ok(())
}

pub fn check_page_size(page_size: usize) -> Result<(), LogBufferError> {
    if !page_size.is_power_of_two() || !(PAGE_MIN_SIZE..=PAGE_MAX_SIZE).contains(&page_size) {
        return Err(LogBufferError::InvalidPageSize(page_size));
    }
    Ok(())
}

#[inline]
pub fn log_length(term_length: usize) -> usize {
    term_length * PARTITION_COUNT + LOG_META_DATA_LENGTH
}

#[inline]
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    term_length.trailing_zeros()
}

/// Claims may not exceed what fits in a term with room for framing.
#[inline]
pub fn max_message_length(term_length: usize) -> usize {
    (term_length / 8).min(MAX_SINGLE_MESSAGE_LENGTH)
}

/// Term count since the stream began. The subtraction wraps in 32 bits
/// before sign extension so term ids may roll over i32::MAX.
#[inline]
pub fn term_count(term_id: i32, initial_term_id: i32) -> i64 {
    i64::from(term_id.wrapping_sub(initial_term_id))
}

#[inline]
pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    (term_count(term_id, initial_term_id) << position_bits_to_shift) + i64::from(term_offset)
}

#[inline]
pub fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    term_count(term_id, initial_term_id) << position_bits_to_shift
}

#[inline]
pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

#[inline]
pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    (position & ((1i64 << position_bits_to_shift) - 1)) as i32
}

#[inline]
pub fn index_by_term_count(term_count: i64) -> usize {
    (term_count.rem_euclid(PARTITION_COUNT as i64)) as usize
}

#[inline]
pub fn index_by_term(initial_term_id: i32, term_id: i32) -> usize {
    index_by_term_count(term_count(term_id, initial_term_id))
}

#[inline]
pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    index_by_term_count(position >> position_bits_to_shift)
}

#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    (i64::from(term_id) << 32) | i64::from(term_offset as u32)
}

#[inline]
pub fn term_id_from_tail(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Tail offset capped at the term length; a raw offset past the end means
/// the term is sealed.
#[inline]
pub fn term_offset_from_tail(raw_tail: i64, term_length: usize) -> i32 {
    let offset = raw_tail & 0xFFFF_FFFF;
    offset.min(term_length as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const BITS: u32 = 16; // 64 KiB term

    #[test]
    fn position_roundtrip() {
        for (term_id, offset) in [(0, 0), (0, 4096), (5, 32), (1000, 65504)] {
            let pos = compute_position(term_id, offset, BITS, 0);
            assert_eq!(compute_term_id_from_position(pos, BITS, 0), term_id);
            assert_eq!(compute_term_offset_from_position(pos, BITS), offset);
        }
    }

    #[test]
    fn position_wraps_term_id() {
        let initial = i32::MAX - 1;
        let wrapped = initial.wrapping_add(3);
        let pos = compute_position(wrapped, 64, BITS, initial);
        assert_eq!(pos, (3i64 << BITS) + 64);
        assert_eq!(compute_term_id_from_position(pos, BITS, initial), wrapped);
    }

    #[test]
    fn partition_rotation() {
        assert_eq!(index_by_term(0, 0), 0);
        assert_eq!(index_by_term(0, 1), 1);
        assert_eq!(index_by_term(0, 2), 2);
        assert_eq!(index_by_term(0, 3), 0);
        assert_eq!(index_by_position(0, BITS), 0);
        assert_eq!(index_by_position(1i64 << BITS, BITS), 1);
        assert_eq!(index_by_position(3i64 << BITS, BITS), 0);
    }

    #[test]
    fn tail_packing() {
        let tail = pack_tail(7, 4096);
        assert_eq!(term_id_from_tail(tail), 7);
        assert_eq!(term_offset_from_tail(tail, 65536), 4096);
        // raw offset beyond the term reads as sealed
        let tail = pack_tail(7, 70000);
        assert_eq!(term_offset_from_tail(tail, 65536), 65536);
    }

    #[test]
    fn term_length_bounds() {
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(check_term_length(64 * 1024 - 1).is_err());
        assert!(check_term_length(32 * 1024).is_err());
        assert!(check_term_length(2 * 1024 * 1024 * 1024).is_err());
    }

    #[test]
    fn max_message() {
        assert_eq!(max_message_length(64 * 1024), 8 * 1024);
        assert_eq!(max_message_length(1024 * 1024 * 1024), 16 * 1024 * 1024);
    }
}
