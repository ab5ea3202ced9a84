//! The set of reader positions attached to one stream, with the untethered
//! lifecycle. Tethered subscribers apply back-pressure through the window
//! math; untethered ones are dropped from delivery when they fall too far
//! behind, and may rejoin later if their subscription allows it.

use sluice_logbuffer::Position;
use sluice_timing::Nanos;

#[derive(Clone, Copy, Debug)]
pub struct SubscriberPosition {
    pub link_registration_id: i64,
    pub position: Position,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UntetheredState {
    Active,
    Linger,
    Resting,
}

#[derive(Clone, Copy, Debug)]
struct UntetheredSub {
    link_registration_id: i64,
    state: UntetheredState,
    time_of_last_update: Nanos,
    window_limit_timeout: Nanos,
    linger_timeout: Nanos,
    resting_timeout: Nanos,
    is_rejoin: bool,
}

/// What the owner must do about an untethered transition. The conductor
/// turns these into client events and counter churn.
#[derive(Clone, Copy, Debug)]
pub enum UntetheredEvent {
    /// Fell below the window limit: delivery stopped, notify unavailable.
    /// The detached position counter is handed back for freeing.
    Unavailable { link_registration_id: i64, position: Position },
    /// Lingered out without rejoin: drop the subscriber entirely.
    Remove { link_registration_id: i64 },
    /// Rested long enough: re-attach at the current join position.
    Rejoin { link_registration_id: i64 },
}

#[derive(Clone, Copy, Debug)]
pub struct UntetheredTimeouts {
    pub window_limit: Nanos,
    pub linger: Nanos,
    pub resting: Nanos,
}

#[derive(Debug, Default)]
pub struct Subscribable {
    positions: Vec<SubscriberPosition>,
    untethered: Vec<UntetheredSub>,
}

impl Subscribable {
    pub fn add_subscriber(
        &mut self,
        link_registration_id: i64,
        position: Position,
        is_tethered: bool,
        is_rejoin: bool,
        timeouts: UntetheredTimeouts,
        now: Nanos,
    ) {
        self.positions.push(SubscriberPosition { link_registration_id, position });
        if !is_tethered {
            self.untethered.push(UntetheredSub {
                link_registration_id,
                state: UntetheredState::Active,
                time_of_last_update: now,
                window_limit_timeout: timeouts.window_limit,
                linger_timeout: timeouts.linger,
                resting_timeout: timeouts.resting,
                is_rejoin,
            });
        }
    }

    /// Remove a subscriber entirely, returning any position counters that
    /// must be freed.
    pub fn remove_subscriber(&mut self, link_registration_id: i64) -> Vec<Position> {
        let mut freed = Vec::new();
        self.positions.retain(|p| {
            if p.link_registration_id == link_registration_id {
                freed.push(p.position);
                false
            } else {
                true
            }
        });
        self.untethered.retain(|u| u.link_registration_id != link_registration_id);
        freed
    }

    /// Re-attach a resting untethered subscriber with a fresh position.
    pub fn rejoin_subscriber(&mut self, link_registration_id: i64, position: Position, now: Nanos) {
        self.positions.push(SubscriberPosition { link_registration_id, position });
        if let Some(untethered) = self
            .untethered
            .iter_mut()
            .find(|u| u.link_registration_id == link_registration_id)
        {
            untethered.state = UntetheredState::Active;
            untethered.time_of_last_update = now;
        }
    }

    #[inline]
    pub fn has_subscribers(&self) -> bool {
        !self.positions.is_empty()
    }

    #[inline]
    pub fn positions(&self) -> &[SubscriberPosition] {
        &self.positions
    }

    pub fn min_position(&self) -> Option<i64> {
        self.positions.iter().map(|p| p.position.get_volatile()).min()
    }

    pub fn max_position(&self) -> Option<i64> {
        self.positions.iter().map(|p| p.position.get_volatile()).max()
    }

    pub fn untethered_state(&self, link_registration_id: i64) -> Option<UntetheredState> {
        self.untethered
            .iter()
            .find(|u| u.link_registration_id == link_registration_id)
            .map(|u| u.state)
    }

    /// Run the untethered state machine. `events` receives the transitions
    /// the owner must act on; lingering subscribers have already been
    /// detached from delivery when `Unavailable` is emitted.
    pub fn check_untethered(
        &mut self,
        now: Nanos,
        consumer_position: i64,
        term_window_length: usize,
        events: &mut Vec<UntetheredEvent>,
    ) {
        let window = term_window_length as i64;
        let limit = consumer_position - window + window / 4;

        let mut to_detach: Vec<i64> = Vec::new();
        let mut to_remove: Vec<i64> = Vec::new();

        for untethered in &mut self.untethered {
            let link = untethered.link_registration_id;
            match untethered.state {
                UntetheredState::Active => {
                    let subscriber = self
                        .positions
                        .iter()
                        .find(|p| p.link_registration_id == link)
                        .map(|p| p.position);
                    let Some(position) = subscriber else { continue };
                    if position.get_volatile() > limit {
                        untethered.time_of_last_update = now;
                    } else if now.saturating_sub(untethered.time_of_last_update)
                        >= untethered.window_limit_timeout
                    {
                        untethered.state = UntetheredState::Linger;
                        untethered.time_of_last_update = now;
                        to_detach.push(link);
                        events.push(UntetheredEvent::Unavailable {
                            link_registration_id: link,
                            position,
                        });
                    }
                }
                UntetheredState::Linger => {
                    if now.saturating_sub(untethered.time_of_last_update)
                        >= untethered.linger_timeout
                    {
                        if untethered.is_rejoin {
                            untethered.state = UntetheredState::Resting;
                            untethered.time_of_last_update = now;
                        } else {
                            to_remove.push(link);
                            events.push(UntetheredEvent::Remove { link_registration_id: link });
                        }
                    }
                }
                UntetheredState::Resting => {
                    if now.saturating_sub(untethered.time_of_last_update)
                        >= untethered.resting_timeout
                    {
                        events.push(UntetheredEvent::Rejoin { link_registration_id: link });
                        // state flips back to Active in rejoin_subscriber
                        untethered.time_of_last_update = now;
                    }
                }
            }
        }

        self.positions
            .retain(|p| !to_detach.contains(&p.link_registration_id));
        self.untethered
            .retain(|u| !to_remove.contains(&u.link_registration_id));
    }
}

#[cfg(test)]
mod tests {
    use sluice_logbuffer::{CounterTable, MappedRegion, METADATA_RECORD_LENGTH, VALUE_RECORD_LENGTH};

    use super::*;

    const WINDOW: usize = 4096;

    struct Fixture {
        _region: MappedRegion,
        table: CounterTable,
    }

    fn fixture() -> Fixture {
        let region = MappedRegion::heap(16 * (METADATA_RECORD_LENGTH + VALUE_RECORD_LENGTH));
        let table = CounterTable::new(
            region.buffer(0, 16 * METADATA_RECORD_LENGTH),
            region.buffer(16 * METADATA_RECORD_LENGTH, 16 * VALUE_RECORD_LENGTH),
            Nanos::ZERO,
        );
        Fixture { _region: region, table }
    }

    fn position(f: &Fixture, value: i64) -> Position {
        let id = f.table.allocate(4, b"", "sub-pos", -1, 1, Nanos(1)).unwrap();
        let p = f.table.position(id);
        p.set_ordered(value);
        p
    }

    fn timeouts() -> UntetheredTimeouts {
        UntetheredTimeouts {
            window_limit: Nanos::from_millis(10),
            linger: Nanos::from_millis(20),
            resting: Nanos::from_millis(30),
        }
    }

    #[test]
    fn min_max_over_positions() {
        let f = fixture();
        let mut s = Subscribable::default();
        s.add_subscriber(1, position(&f, 100), true, true, timeouts(), Nanos(0));
        s.add_subscriber(2, position(&f, 300), true, true, timeouts(), Nanos(0));
        assert_eq!(s.min_position(), Some(100));
        assert_eq!(s.max_position(), Some(300));

        let freed = s.remove_subscriber(1);
        assert_eq!(freed.len(), 1);
        assert_eq!(s.min_position(), Some(300));
    }

    #[test]
    fn untethered_full_cycle_with_rejoin() {
        let f = fixture();
        let mut s = Subscribable::default();
        let lagging = position(&f, 0);
        s.add_subscriber(9, lagging, false, true, timeouts(), Nanos(0));

        let consumer = 100_000i64; // limit is far above the lagging position
        let mut events = Vec::new();

        // below the limit but inside the window-limit timeout: no event yet
        s.check_untethered(Nanos::from_millis(5), consumer, WINDOW, &mut events);
        assert!(events.is_empty());
        assert_eq!(s.untethered_state(9), Some(UntetheredState::Active));

        // timeout expires: detached and reported unavailable
        s.check_untethered(Nanos::from_millis(11), consumer, WINDOW, &mut events);
        assert!(matches!(
            events[..],
            [UntetheredEvent::Unavailable { link_registration_id: 9, .. }]
        ));
        assert!(!s.has_subscribers());
        assert_eq!(s.untethered_state(9), Some(UntetheredState::Linger));

        // linger expires into resting (rejoinable link)
        events.clear();
        s.check_untethered(Nanos::from_millis(31), consumer, WINDOW, &mut events);
        assert!(events.is_empty());
        assert_eq!(s.untethered_state(9), Some(UntetheredState::Resting));

        // resting expires: owner asked to rejoin
        s.check_untethered(Nanos::from_millis(61), consumer, WINDOW, &mut events);
        assert!(matches!(events[..], [UntetheredEvent::Rejoin { link_registration_id: 9 }]));

        s.rejoin_subscriber(9, position(&f, consumer), Nanos::from_millis(61));
        assert_eq!(s.untethered_state(9), Some(UntetheredState::Active));
        assert_eq!(s.min_position(), Some(consumer));
    }

    #[test]
    fn untethered_non_rejoin_is_removed() {
        let f = fixture();
        let mut s = Subscribable::default();
        s.add_subscriber(9, position(&f, 0), false, false, timeouts(), Nanos(0));

        let mut events = Vec::new();
        s.check_untethered(Nanos::from_millis(11), 100_000, WINDOW, &mut events);
        events.clear();
        s.check_untethered(Nanos::from_millis(31), 100_000, WINDOW, &mut events);
        assert!(matches!(events[..], [UntetheredEvent::Remove { link_registration_id: 9 }]));
        assert_eq!(s.untethered_state(9), None);
    }

    #[test]
    fn keeping_up_never_transitions() {
        let f = fixture();
        let mut s = Subscribable::default();
        let keeping_up = position(&f, 99_000);
        s.add_subscriber(9, keeping_up, false, true, timeouts(), Nanos(0));

        let mut events = Vec::new();
        for t in (0..100).step_by(10) {
            s.check_untethered(Nanos::from_millis(t), 100_000, WINDOW, &mut events);
        }
        assert!(events.is_empty());
        assert!(s.has_subscribers());
    }
}
