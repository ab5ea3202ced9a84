//! Delay generators pacing NAK emission and retransmit scheduling.
//!
//! Unicast uses a small static delay (or none, for retransmits). Multicast
//! backs off exponentially with jitter so a loss burst doesn't synchronize
//! every receiver's NAK.

use rand::Rng;
use sluice_timing::Nanos;

#[derive(Clone, Debug)]
pub enum FeedbackDelay {
    Static { delay: Nanos },
    Exponential { min: Nanos, max: Nanos },
}

impl FeedbackDelay {
    pub fn immediate() -> Self {
        Self::Static { delay: Nanos::ZERO }
    }

    /// Delay before acting on the `retry`-th observation of the same gap.
    /// Exponential variants double per retry up to `max`.
    pub fn delay(&self, retry: u32) -> Nanos {
        match self {
            Self::Static { delay } => *delay,
            Self::Exponential { min, max } => {
                let doubled = min.0.saturating_mul(1u64 << retry.min(32));
                let capped = doubled.min(max.0);
                // jitter in [capped/2, capped] decorrelates receivers
                let base = capped / 2;
                Nanos(base + rand::rng().random_range(0..=capped - base))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_delay_is_constant() {
        let r#gen = FeedbackDelay::Static { delay: Nanos::from_micros(100) };
        assert_eq!(r#gen.delay(0), Nanos::from_micros(100));
        assert_eq!(r#gen.delay(5), Nanos::from_micros(100));
    }

    #[test]
    fn exponential_backs_off_and_caps() {
        let r#gen = FeedbackDelay::Exponential {
            min: Nanos::from_micros(10),
            max: Nanos::from_millis(10),
        };
        for retry in 0..20 {
            let d = r#gen.delay(retry);
            assert!(d <= Nanos::from_millis(10));
            assert!(d >= Nanos::from_micros(5));
        }
        // by retry 20 the cap dominates
        assert!(r#gen.delay(20) >= Nanos::from_millis(5));
    }
}
