use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;
use quanta::Mock;

use crate::Nanos;

pub type Clock = quanta::Clock;

#[derive(Clone, Debug)]
pub enum NanoClock {
    Clock(Clock),
    System,
}

impl NanoClock {
    pub fn raw(&self) -> u64 {
        match self {
            NanoClock::Clock(clock) => clock.raw(),
            NanoClock::System => unsafe {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_unchecked().as_nanos() as u64
            },
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        Nanos(self.raw())
    }
}

// might be mocked
static GLOBAL_CLOCK: OnceCell<NanoClock> = OnceCell::new();

#[inline]
pub fn init_global_with_mock() -> Arc<Mock> {
    let (mock, controller) = Clock::mock();
    let mock = GLOBAL_CLOCK.get_or_init(|| NanoClock::Clock(mock));
    // guards against 2 threads racing to install different mocks
    assert_eq!(mock.raw(), 0, "do not initialize the global mock clock from 2 different threads");
    controller.increment(1);
    controller
}

#[inline]
pub fn global_clock() -> &'static NanoClock {
    GLOBAL_CLOCK.get_or_init(|| NanoClock::System)
}

/// Clock value sampled once per agent duty cycle and reused by every timed
/// decision inside that cycle. The cached value is published with release
/// ordering so other agents can observe a recent timestamp cheaply.
#[derive(Debug, Default)]
pub struct CachedNanoClock {
    cached: AtomicU64,
}

impl CachedNanoClock {
    pub const fn new() -> Self {
        Self { cached: AtomicU64::new(0) }
    }

    #[inline]
    pub fn update(&self, now: Nanos) {
        self.cached.store(now.0, Ordering::Release);
    }

    #[inline]
    pub fn sample_and_update(&self) -> Nanos {
        let now = global_clock().now();
        self.update(now);
        now
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        Nanos(self.cached.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_clock_holds_last_update() {
        let clock = CachedNanoClock::new();
        clock.update(Nanos(42));
        assert_eq!(clock.now(), Nanos(42));
        clock.update(Nanos(43));
        assert_eq!(clock.now(), Nanos(43));
    }
}
