//! Control-plane rings built from seqlock slots in shared memory.
//!
//! Two kinds: `Spsc` carries client commands to the driver and refuses
//! writes when the consumer lags a full ring behind; `Broadcast` carries
//! driver events to every attached client, and a slow client gets lapped
//! rather than back-pressuring the driver.

use std::{
    alloc::Layout,
    mem::size_of,
    ops::Deref,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use shared_memory::{ShmemConf, ShmemError};

use crate::{
    Seqlock,
    error::{RecvError, RingError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RingKind {
    Unknown,
    Spsc,
    Broadcast,
}

#[derive(Debug)]
#[repr(C, align(64))]
struct RingHeader {
    kind: u8,           // 1
    is_initialized: u8, // 2
    _pad1: [u8; 6],     // 8
    elsize: usize,      // 16
    mask: usize,        // 24
    head: AtomicUsize,  // 32
    _pad2: [u8; 32],    // 64
    // consumer progress on its own line so the producer's fullness check
    // doesn't false-share with slot writes
    consumed: AtomicUsize,
    _pad3: [u8; 56],
}

impl RingHeader {
    fn from_ptr(ptr: *mut u8) -> &'static mut Self {
        unsafe { &mut *(ptr as *mut Self) }
    }

    fn is_initialized(&self) -> bool {
        self.is_initialized == 1
    }

    fn open_shared(path: &Path) -> Result<&'static mut Self, RingError> {
        let shmem = ShmemConf::new().flink(path).open()?;
        let ptr = shmem.as_ptr();
        std::mem::forget(shmem);
        Ok(Self::from_ptr(ptr))
    }
}

#[repr(C, align(64))]
pub struct InnerRing<T> {
    header: RingHeader,
    slots: [Seqlock<T>],
}

impl<T: Copy> InnerRing<T> {
    pub const fn size_for(len: usize) -> usize {
        size_of::<RingHeader>() + len.next_power_of_two() * size_of::<Seqlock<T>>()
    }

    /// Largest power-of-two slot count that fits in `region_len` bytes.
    pub fn len_for_region(region_len: usize) -> usize {
        let slots = (region_len.saturating_sub(size_of::<RingHeader>())) / size_of::<Seqlock<T>>();
        if slots.is_power_of_two() { slots } else { slots.next_power_of_two() / 2 }
    }

    fn new(len: usize, kind: RingKind) -> *const Self {
        let real_len = len.next_power_of_two();
        let size = Self::size_for(real_len);
        unsafe {
            let ptr = std::alloc::alloc_zeroed(
                Layout::array::<u8>(size).unwrap().align_to(64).unwrap().pad_to_align(),
            );
            Self::from_uninitialized_ptr(ptr, real_len, kind)
        }
    }

    fn from_uninitialized_ptr(ptr: *mut u8, len: usize, kind: RingKind) -> *const Self {
        unsafe {
            // the fat pointer length covers only the unsized slot tail
            let r = std::ptr::slice_from_raw_parts_mut(ptr, len) as *mut Self;
            (*r).header.kind = kind as u8;
            (*r).header.mask = len - 1;
            (*r).header.elsize = size_of::<Seqlock<T>>();
            (*r).header.head = AtomicUsize::new(0);
            (*r).header.consumed = AtomicUsize::new(0);
            (*r).header.is_initialized = 1;
            r
        }
    }

    fn from_initialized_ptr(ptr: *mut RingHeader) -> Result<*const Self, RingError> {
        unsafe {
            let len = (*ptr).mask + 1;
            if !len.is_power_of_two() {
                return Err(RingError::LengthNotPowerOfTwo);
            }
            if !(*ptr).is_initialized() {
                return Err(RingError::UnInitialized);
            }
            Ok(std::ptr::slice_from_raw_parts_mut(ptr as *mut Seqlock<T>, len) as *const Self)
        }
    }

    #[inline]
    fn kind(&self) -> RingKind {
        match self.header.kind {
            1 => RingKind::Spsc,
            2 => RingKind::Broadcast,
            _ => RingKind::Unknown,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.header.mask + 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head() == 0
    }

    #[inline]
    fn head(&self) -> usize {
        self.header.head.load(Ordering::Relaxed)
    }

    #[inline]
    fn load(&self, pos: usize) -> &Seqlock<T> {
        unsafe { self.slots.get_unchecked(pos) }
    }

    #[inline]
    fn cur_pos(&self) -> usize {
        self.head() & self.header.mask
    }

    #[inline]
    fn version(&self) -> u64 {
        (((self.head() / (self.header.mask + 1)) << 1) + 2) as u64
    }

    fn validate(&self, len: usize) -> Result<(), RingError> {
        let elsize = size_of::<Seqlock<T>>();
        if self.len() < len {
            return Err(RingError::TooSmall);
        }
        if !self.len().is_power_of_two() {
            return Err(RingError::LengthNotPowerOfTwo);
        }
        if self.header.elsize != elsize {
            return Err(RingError::ElementSizeChanged(self.header.elsize, elsize));
        }
        Ok(())
    }

    fn create_or_open_shared(path: &Path, mut len: usize, kind: RingKind) -> *const Self {
        let _ = std::fs::create_dir_all(path.parent().unwrap());
        len = len.next_power_of_two();
        match ShmemConf::new().size(Self::size_for(len)).flink(path).create() {
            Ok(shmem) => {
                let ptr = shmem.as_ptr();
                std::mem::forget(shmem);
                Self::from_uninitialized_ptr(ptr, len, kind)
            }
            Err(ShmemError::LinkExists) => {
                let Ok(r) = Self::open_shared(path).inspect_err(|e| {
                    tracing::warn!(
                        "issue opening preexisting ring at {path:?}: {e}. Removing the link file and recreating."
                    )
                }) else {
                    let _ = std::fs::remove_file(path);
                    return Self::create_or_open_shared(path, len, kind);
                };
                if let Err(e) = unsafe { (*r).validate(len) } {
                    tracing::error!(
                        "issue with preexisting ring at {path:?}: {e}. Removing the link file and recreating."
                    );
                    let _ = std::fs::remove_file(path);
                    return Self::create_or_open_shared(path, len, kind);
                }
                r
            }
            Err(e) => panic!("{e}"),
        }
    }

    fn open_shared(path: &Path) -> Result<*const Self, RingError> {
        if !path.exists() {
            return Err(RingError::NonExistingFile);
        }
        let mut tries = 0;
        let mut header = RingHeader::open_shared(path)?;
        while !header.is_initialized() {
            // another process may still be initializing the same ring
            std::thread::sleep(std::time::Duration::from_millis(1));
            header = RingHeader::open_shared(path)?;
            if tries == 10 {
                return Err(RingError::UnInitialized);
            }
            tries += 1;
        }
        Self::from_initialized_ptr(header)
    }

    #[inline]
    fn try_produce(&self, item: &T) -> Result<usize, RingError> {
        let head = self.head();
        if self.kind() == RingKind::Spsc {
            let consumed = self.header.consumed.load(Ordering::Relaxed);
            if head.wrapping_sub(consumed) > self.header.mask {
                return Err(RingError::Full);
            }
        }
        self.load(head & self.header.mask).write(item);
        self.header.head.store(head.wrapping_add(1), Ordering::Relaxed);
        Ok(head)
    }
}

unsafe impl<T> Send for InnerRing<T> {}
unsafe impl<T> Sync for InnerRing<T> {}

/// Cheap shareable handle onto an `InnerRing`.
#[derive(Debug)]
pub struct Ring<T> {
    inner: *const InnerRing<T>,
}

impl<T> Clone for Ring<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Ring<T> {}

unsafe impl<T> Send for Ring<T> {}
unsafe impl<T> Sync for Ring<T> {}

impl<T: Copy> Ring<T> {
    pub fn new(len: usize, kind: RingKind) -> Self {
        Self { inner: InnerRing::new(len, kind) }
    }

    pub fn create_or_open_shared(path: &Path, len: usize, kind: RingKind) -> Self {
        Self { inner: InnerRing::create_or_open_shared(path, len, kind) }
    }

    pub fn open_shared(path: &Path) -> Result<Self, RingError> {
        Ok(Self { inner: InnerRing::open_shared(path)? })
    }

    /// Place a ring inside a preexisting region, e.g. one section of the
    /// cnc file. `init` is true for the creating process only.
    pub fn from_region(ptr: *mut u8, region_len: usize, kind: RingKind, init: bool) -> Result<Self, RingError> {
        let len = InnerRing::<T>::len_for_region(region_len);
        if len == 0 {
            return Err(RingError::TooSmall);
        }
        if init {
            Ok(Self { inner: InnerRing::from_uninitialized_ptr(ptr, len, kind) })
        } else {
            let inner = InnerRing::<T>::from_initialized_ptr(ptr.cast::<RingHeader>())?;
            unsafe { (*inner).validate(len)? };
            Ok(Self { inner })
        }
    }
}

impl<T> Deref for Ring<T> {
    type Target = InnerRing<T>;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.inner }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RingProducer<T> {
    ring: Ring<T>,
}

impl<T: Copy> From<Ring<T>> for RingProducer<T> {
    fn from(ring: Ring<T>) -> Self {
        Self { ring }
    }
}

impl<T: Copy> RingProducer<T> {
    pub fn produce(&self, msg: &T) -> Result<usize, RingError> {
        self.ring.try_produce(msg)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RingConsumer<T> {
    pos: usize,
    mask: usize,
    expected_version: u64,
    consumed: usize,
    ring: Ring<T>,
}

impl<T: Copy> From<Ring<T>> for RingConsumer<T> {
    fn from(ring: Ring<T>) -> Self {
        let consumed = ring.head();
        if ring.kind() == RingKind::Spsc {
            ring.header.consumed.store(consumed, Ordering::Relaxed);
        }
        Self {
            pos: ring.cur_pos(),
            mask: ring.header.mask,
            expected_version: ring.version(),
            consumed,
            ring,
        }
    }
}

impl<T: Copy> RingConsumer<T> {
    #[inline]
    fn update_pos(&mut self) {
        self.pos = (self.pos + 1) & self.mask;
        self.expected_version = self.expected_version.wrapping_add(2 * (self.pos == 0) as u64);
        self.consumed = self.consumed.wrapping_add(1);
        if self.ring.kind() == RingKind::Spsc {
            self.ring.header.consumed.store(self.consumed, Ordering::Relaxed);
        }
    }

    /// Nonblocking consume returning either Ok(()) or a RecvError.
    #[inline]
    pub fn try_consume(&mut self, el: &mut T) -> Result<(), RecvError> {
        self.ring.load(self.pos).read_with_version(el, self.expected_version)?;
        self.update_pos();
        Ok(())
    }

    /// Skip ahead a whole generation after being lapped.
    #[inline]
    pub fn recover_after_lap(&mut self) {
        self.expected_version += 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headersize() {
        assert_eq!(128, size_of::<RingHeader>());
    }

    #[test]
    fn basic() {
        for kind in [RingKind::Spsc, RingKind::Broadcast] {
            let r = Ring::new(16, kind);
            let p = RingProducer::from(r);
            let mut c = RingConsumer::from(r);
            let mut m = 0;

            p.produce(&1).unwrap();
            assert_eq!(c.try_consume(&mut m), Ok(()));
            assert_eq!(m, 1);
            assert!(matches!(c.try_consume(&mut m), Err(RecvError::Empty)));

            for i in 0..16 {
                p.produce(&i).unwrap();
            }
            for i in 0..16 {
                c.try_consume(&mut m).unwrap();
                assert_eq!(m, i);
            }
            assert!(matches!(c.try_consume(&mut m), Err(RecvError::Empty)));
        }
    }

    #[test]
    fn spsc_refuses_when_full() {
        let r = Ring::new(8, RingKind::Spsc);
        let p = RingProducer::from(r);
        let mut c = RingConsumer::from(r);

        for i in 0..8 {
            p.produce(&i).unwrap();
        }
        assert!(matches!(p.produce(&99), Err(RingError::Full)));

        let mut m = 0;
        c.try_consume(&mut m).unwrap();
        p.produce(&99).unwrap();
    }

    #[test]
    fn broadcast_laps_slow_consumer() {
        let r = Ring::new(8, RingKind::Broadcast);
        let p = RingProducer::from(r);
        let mut c = RingConsumer::from(r);

        for i in 0..20 {
            p.produce(&i).unwrap();
        }
        let mut m = 0;
        assert!(matches!(c.try_consume(&mut m), Err(RecvError::Lapped)));
        c.recover_after_lap();
    }

    #[test]
    fn two_broadcast_consumers_see_everything() {
        let r = Ring::new(16, RingKind::Broadcast);
        let p = RingProducer::from(r);
        let mut c1 = RingConsumer::from(r);
        let mut c2 = RingConsumer::from(r);

        for i in 0..10 {
            p.produce(&i).unwrap();
        }
        let mut m = 0;
        for i in 0..10 {
            c1.try_consume(&mut m).unwrap();
            assert_eq!(m, i);
        }
        for i in 0..10 {
            c2.try_consume(&mut m).unwrap();
            assert_eq!(m, i);
        }
    }

    #[test]
    fn shared_ring_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring-test");
        let r: Ring<u64> = Ring::create_or_open_shared(&path, 16, RingKind::Spsc);
        let p = RingProducer::from(r);
        p.produce(&42).unwrap();

        let view: Ring<u64> = Ring::open_shared(&path).unwrap();
        let mut c = RingConsumer::from(view);
        // a consumer attaching later starts at the current head
        let mut m = 0;
        assert!(matches!(c.try_consume(&mut m), Err(RecvError::Empty)));
        p.produce(&43).unwrap();
        c.try_consume(&mut m).unwrap();
        assert_eq!(m, 43);
    }

    #[test]
    fn from_region() {
        let region = crate::MappedRegion::heap(4096);
        let r: Ring<u64> =
            Ring::from_region(region.ptr(), region.len(), RingKind::Spsc, true).unwrap();
        let p = RingProducer::from(r);
        let mut c = RingConsumer::from(r);
        p.produce(&7).unwrap();
        let mut m = 0;
        c.try_consume(&mut m).unwrap();
        assert_eq!(m, 7);

        let attached: Ring<u64> =
            Ring::from_region(region.ptr(), region.len(), RingKind::Spsc, false).unwrap();
        assert_eq!(attached.len(), r.len());
    }
}
