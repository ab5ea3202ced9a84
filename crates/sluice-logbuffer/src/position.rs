use std::sync::atomic::{AtomicI64, Ordering};

/// Handle onto one counter value slot. Single writer, many readers;
/// publication is a release store matched by acquire loads.
#[derive(Clone, Copy, Debug)]
pub struct Position {
    id: i32,
    value: *const AtomicI64,
}

unsafe impl Send for Position {}
unsafe impl Sync for Position {}

impl Position {
    pub(crate) fn new(id: i32, value: *const AtomicI64) -> Self {
        Self { id, value }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    fn atom(&self) -> &AtomicI64 {
        unsafe { &*self.value }
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.atom().load(Ordering::Relaxed)
    }

    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.atom().load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.atom().store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_ordered(&self, value: i64) {
        self.atom().store(value, Ordering::Release);
    }

    #[inline]
    pub fn propose_max_ordered(&self, value: i64) -> bool {
        if value > self.get() {
            self.set_ordered(value);
            return true;
        }
        false
    }

    /// Statistic-style use: advisory, relaxed.
    #[inline]
    pub fn add(&self, delta: i64) {
        self.atom().fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }
}
