use std::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicU64, Ordering, compiler_fence},
};

use crate::error::RecvError;

/// A single-writer sequential lock. Versions start at 0 (never written),
/// are odd while a write is in flight and even once it lands.
#[repr(C, align(64))]
pub struct Seqlock<T> {
    version: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Seqlock<T> {}
unsafe impl<T: Send> Sync for Seqlock<T> {}

impl<T: Copy> Seqlock<T> {
    #[inline]
    pub const fn new(val: T) -> Seqlock<T> {
        Seqlock { version: AtomicU64::new(2), data: UnsafeCell::new(val) }
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Read the slot expecting exactly `expected_version`. `Empty` means the
    /// writer has not reached this version yet; `Lapped` means it has moved
    /// past it and the data is gone.
    #[inline(never)]
    pub fn read_with_version(&self, result: &mut T, expected_version: u64) -> Result<(), RecvError> {
        let v1 = self.version.load(Ordering::Acquire);
        if v1 < expected_version {
            return Err(RecvError::Empty);
        }

        compiler_fence(Ordering::AcqRel);
        *result = unsafe { *self.data.get() };
        compiler_fence(Ordering::AcqRel);
        let v2 = self.version.load(Ordering::Acquire);
        if v2 == expected_version { Ok(()) } else { Err(RecvError::Lapped) }
    }

    #[inline(never)]
    pub fn write(&self, data: &T) {
        // Odd version forces concurrent readers to retry until the write
        // lands.
        let v = self.version.fetch_add(1, Ordering::Release);
        compiler_fence(Ordering::AcqRel);
        unsafe { *self.data.get() = *data };
        compiler_fence(Ordering::AcqRel);
        self.version.store(v.wrapping_add(2), Ordering::Release);
    }
}

impl<T: Default> Default for Seqlock<T> {
    #[inline]
    fn default() -> Seqlock<T> {
        Seqlock { version: AtomicU64::new(0), data: UnsafeCell::new(T::default()) }
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Seqlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seqlock {{ data: {:?} }}", unsafe { *self.data.get() })
    }
}
