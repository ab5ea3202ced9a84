//! Fixed-slot registry of 64-bit counters with metadata.
//!
//! Metadata records are 512 bytes:
//!
//! ```text
//! 0   state                    i32  (release on allocate, acquire on read)
//! 4   type id                  i32
//! 8   registration id          i64
//! 16  owner id                 i64  (NULL_OWNER_ID for static counters)
//! 24  free-for-reuse deadline  i64
//! 32  key                      64 bytes
//! 96  label length             i32
//! 100 label                    up to 380 bytes
//! ```
//!
//! Values live in a parallel buffer, one cache line per counter.

use std::sync::atomic::AtomicI64;

use sluice_timing::Nanos;

use crate::{AtomicBuffer, Position, error::CountersError};

pub const NULL_COUNTER_ID: i32 = -1;
pub const NULL_OWNER_ID: i64 = -1;
pub const NULL_REGISTRATION_ID: i64 = -1;

pub const METADATA_RECORD_LENGTH: usize = 512;
pub const VALUE_RECORD_LENGTH: usize = 64;
pub const KEY_MAX_LENGTH: usize = 64;
pub const LABEL_MAX_LENGTH: usize = 380;

const STATE_OFFSET: usize = 0;
const TYPE_ID_OFFSET: usize = 4;
const REGISTRATION_ID_OFFSET: usize = 8;
const OWNER_ID_OFFSET: usize = 16;
const DEADLINE_OFFSET: usize = 24;
const KEY_OFFSET: usize = 32;
const LABEL_LENGTH_OFFSET: usize = 96;
const LABEL_OFFSET: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CounterState {
    Unused = 0,
    Allocated = 1,
    Reclaimed = -1,
}

impl CounterState {
    fn from_i32(raw: i32) -> Self {
        match raw {
            1 => Self::Allocated,
            -1 => Self::Reclaimed,
            _ => Self::Unused,
        }
    }
}

pub struct CounterTable {
    metadata: AtomicBuffer,
    values: AtomicBuffer,
    capacity: usize,
    free_to_reuse_timeout: Nanos,
}

impl CounterTable {
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer, free_to_reuse_timeout: Nanos) -> Self {
        let capacity = (metadata.capacity() / METADATA_RECORD_LENGTH)
            .min(values.capacity() / VALUE_RECORD_LENGTH);
        Self { metadata, values, capacity, free_to_reuse_timeout }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn record(&self, id: i32) -> usize {
        id as usize * METADATA_RECORD_LENGTH
    }

    #[inline]
    pub fn state(&self, id: i32) -> CounterState {
        CounterState::from_i32(self.metadata.get_i32_volatile(self.record(id) + STATE_OFFSET))
    }

    #[inline]
    pub fn type_id(&self, id: i32) -> i32 {
        self.metadata.get_i32(self.record(id) + TYPE_ID_OFFSET)
    }

    #[inline]
    pub fn registration_id(&self, id: i32) -> i64 {
        self.metadata.get_i64(self.record(id) + REGISTRATION_ID_OFFSET)
    }

    #[inline]
    pub fn owner_id(&self, id: i32) -> i64 {
        self.metadata.get_i64(self.record(id) + OWNER_ID_OFFSET)
    }

    pub fn label(&self, id: i32) -> String {
        let offset = self.record(id);
        let len = (self.metadata.get_i32(offset + LABEL_LENGTH_OFFSET) as usize).min(LABEL_MAX_LENGTH);
        String::from_utf8_lossy(self.metadata.slice(offset + LABEL_OFFSET, len)).into_owned()
    }

    pub fn key(&self, id: i32) -> [u8; KEY_MAX_LENGTH] {
        let mut key = [0u8; KEY_MAX_LENGTH];
        self.metadata.get_bytes(self.record(id) + KEY_OFFSET, &mut key);
        key
    }

    /// Handle onto the value slot, valid for the table's lifetime.
    pub fn position(&self, id: i32) -> Position {
        let ptr = self.values.slice(id as usize * VALUE_RECORD_LENGTH, 8).as_ptr();
        Position::new(id, ptr.cast::<AtomicI64>())
    }

    pub fn allocate(
        &self,
        type_id: i32,
        key: &[u8],
        label: &str,
        registration_id: i64,
        owner_id: i64,
        now: Nanos,
    ) -> Result<i32, CountersError> {
        if key.len() > KEY_MAX_LENGTH {
            return Err(CountersError::KeyTooLong(key.len()));
        }
        if label.len() > LABEL_MAX_LENGTH {
            return Err(CountersError::LabelTooLong(label.len()));
        }
        if registration_id != NULL_REGISTRATION_ID && owner_id != NULL_OWNER_ID {
            if let Some(existing) = self.find_allocated(type_id, registration_id) {
                if self.owner_id(existing) == NULL_OWNER_ID {
                    return Err(CountersError::CollidesWithStatic { type_id, registration_id });
                }
            }
        }

        let id = self.find_free_slot(now).ok_or(CountersError::Exhausted)?;
        let offset = self.record(id);

        self.metadata.put_i32(offset + TYPE_ID_OFFSET, type_id);
        self.metadata.put_i64(offset + REGISTRATION_ID_OFFSET, registration_id);
        self.metadata.put_i64(offset + OWNER_ID_OFFSET, owner_id);
        self.metadata.put_i64(offset + DEADLINE_OFFSET, 0);
        self.metadata.set_memory(offset + KEY_OFFSET, KEY_MAX_LENGTH, 0);
        self.metadata.put_bytes(offset + KEY_OFFSET, key);
        self.metadata.put_i32(offset + LABEL_LENGTH_OFFSET, label.len() as i32);
        self.metadata.put_bytes(offset + LABEL_OFFSET, label.as_bytes());
        self.position(id).set(0);

        // metadata is in place before the slot is published
        self.metadata
            .put_i32_ordered(offset + STATE_OFFSET, CounterState::Allocated as i32);
        Ok(id)
    }

    /// Idempotent allocation keyed by `(typeId, registrationId)`; the
    /// counter's lifetime is decoupled from any client.
    pub fn allocate_static(
        &self,
        type_id: i32,
        key: &[u8],
        label: &str,
        registration_id: i64,
        now: Nanos,
    ) -> Result<i32, CountersError> {
        if let Some(existing) = self.find_allocated(type_id, registration_id) {
            if self.owner_id(existing) != NULL_OWNER_ID {
                return Err(CountersError::CollidesWithNonStatic { type_id, registration_id });
            }
            // key and label stay as first registered
            return Ok(existing);
        }
        self.allocate(type_id, key, label, registration_id, NULL_OWNER_ID, now)
    }

    /// ALLOCATED -> RECLAIMED; the slot becomes reusable once the grace
    /// period passes.
    pub fn free(&self, id: i32, now: Nanos) -> Result<(), CountersError> {
        if self.state(id) != CounterState::Allocated {
            return Err(CountersError::NotAllocated(id));
        }
        let offset = self.record(id);
        self.metadata
            .put_i64(offset + DEADLINE_OFFSET, i64::from(now + self.free_to_reuse_timeout));
        self.metadata
            .put_i32_ordered(offset + STATE_OFFSET, CounterState::Reclaimed as i32);
        Ok(())
    }

    /// Free every counter owned by `owner_id`. Static counters have a null
    /// owner and are untouched. Returns the freed ids.
    pub fn free_for_owner(&self, owner_id: i64, now: Nanos) -> Vec<i32> {
        let mut freed = Vec::new();
        if owner_id == NULL_OWNER_ID {
            return freed;
        }
        for id in 0..self.capacity as i32 {
            if self.state(id) == CounterState::Allocated && self.owner_id(id) == owner_id {
                let _ = self.free(id, now);
                freed.push(id);
            }
        }
        freed
    }

    fn find_allocated(&self, type_id: i32, registration_id: i64) -> Option<i32> {
        (0..self.capacity as i32).find(|&id| {
            self.state(id) == CounterState::Allocated
                && self.type_id(id) == type_id
                && self.registration_id(id) == registration_id
        })
    }

    fn find_free_slot(&self, now: Nanos) -> Option<i32> {
        for id in 0..self.capacity as i32 {
            match self.state(id) {
                CounterState::Unused => return Some(id),
                CounterState::Reclaimed => {
                    let deadline = self.metadata.get_i64(self.record(id) + DEADLINE_OFFSET);
                    if i64::from(now) >= deadline {
                        return Some(id);
                    }
                }
                CounterState::Allocated => {}
            }
        }
        None
    }

    pub fn for_each_allocated(&self, mut f: impl FnMut(i32, i32, i64, &str)) {
        for id in 0..self.capacity as i32 {
            if self.state(id) == CounterState::Allocated {
                f(id, self.type_id(id), self.position(id).get_volatile(), &self.label(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MappedRegion;

    fn table(region: &MappedRegion, grace: Nanos) -> CounterTable {
        let meta_len = 32 * METADATA_RECORD_LENGTH;
        let metadata = region.buffer(0, meta_len);
        let values = region.buffer(meta_len, 32 * VALUE_RECORD_LENGTH);
        CounterTable::new(metadata, values, grace)
    }

    fn region() -> MappedRegion {
        MappedRegion::heap(32 * (METADATA_RECORD_LENGTH + VALUE_RECORD_LENGTH))
    }

    #[test]
    fn allocate_and_read_back() {
        let region = region();
        let t = table(&region, Nanos::ZERO);

        let id = t.allocate(1001, b"key", "publisher limit", 7, 3, Nanos(1)).unwrap();
        assert_eq!(t.state(id), CounterState::Allocated);
        assert_eq!(t.type_id(id), 1001);
        assert_eq!(t.registration_id(id), 7);
        assert_eq!(t.owner_id(id), 3);
        assert_eq!(t.label(id), "publisher limit");
        assert_eq!(&t.key(id)[..3], b"key");

        let pos = t.position(id);
        pos.set_ordered(4096);
        assert_eq!(t.position(id).get_volatile(), 4096);
    }

    #[test]
    fn reclaimed_slot_reused_after_grace() {
        let region = region();
        let t = table(&region, Nanos::from_millis(1));

        let id = t.allocate(1, b"", "a", NULL_REGISTRATION_ID, 1, Nanos(0)).unwrap();
        t.free(id, Nanos(0)).unwrap();
        assert_eq!(t.state(id), CounterState::Reclaimed);

        // within the grace period the slot is skipped
        let id2 = t.allocate(1, b"", "b", NULL_REGISTRATION_ID, 1, Nanos(10)).unwrap();
        assert_ne!(id, id2);

        // after the grace period it is recycled
        let id3 = t
            .allocate(1, b"", "c", NULL_REGISTRATION_ID, 1, Nanos::from_millis(2))
            .unwrap();
        assert_eq!(id, id3);
    }

    #[test]
    fn static_counter_idempotent() {
        let region = region();
        let t = table(&region, Nanos::ZERO);

        let id = t.allocate_static(1101, b"K", "L", 100, Nanos(1)).unwrap();
        let again = t.allocate_static(1101, b"other-key", "other-label", 100, Nanos(2)).unwrap();
        assert_eq!(id, again);
        assert_eq!(t.owner_id(id), NULL_OWNER_ID);
        // first registration wins
        assert_eq!(t.label(id), "L");
        assert_eq!(&t.key(id)[..1], b"K");
    }

    #[test]
    fn static_counter_survives_owner_reclaim() {
        let region = region();
        let t = table(&region, Nanos::ZERO);

        let stat = t.allocate_static(1101, b"K", "L", 100, Nanos(1)).unwrap();
        let owned = t.allocate(7, b"", "owned", NULL_REGISTRATION_ID, 42, Nanos(1)).unwrap();

        let freed = t.free_for_owner(42, Nanos(2));
        assert_eq!(freed, vec![owned]);
        assert_eq!(t.state(stat), CounterState::Allocated);
        assert_eq!(t.state(owned), CounterState::Reclaimed);
    }

    #[test]
    fn non_static_collision_with_static_rejected() {
        let region = region();
        let t = table(&region, Nanos::ZERO);

        t.allocate_static(1101, b"K", "L", 100, Nanos(1)).unwrap();
        let err = t.allocate(1101, b"K", "L", 100, 42, Nanos(2)).unwrap_err();
        assert!(matches!(err, CountersError::CollidesWithStatic { .. }));
    }

    #[test]
    fn static_collision_with_non_static_rejected() {
        let region = region();
        let t = table(&region, Nanos::ZERO);

        t.allocate(1101, b"K", "L", 100, 42, Nanos(1)).unwrap();
        let err = t.allocate_static(1101, b"K", "L", 100, Nanos(2)).unwrap_err();
        assert!(matches!(err, CountersError::CollidesWithNonStatic { .. }));
    }

    #[test]
    fn exhaustion() {
        let region = region();
        let t = table(&region, Nanos::ZERO);
        for _ in 0..t.capacity() {
            t.allocate(1, b"", "x", NULL_REGISTRATION_ID, 1, Nanos(1)).unwrap();
        }
        assert!(matches!(
            t.allocate(1, b"", "x", NULL_REGISTRATION_ID, 1, Nanos(1)),
            Err(CountersError::Exhausted)
        ));
    }
}
