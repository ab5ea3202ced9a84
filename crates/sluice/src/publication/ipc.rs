//! In-process shared-memory publication: the writer and every reader map
//! the same log, so the driver's whole job is position accounting, limit
//! advancement, cleaning, unblocking dead writers and lifecycle.

use std::sync::Arc;

use sluice_logbuffer::{LogBuffers, Position};
use sluice_timing::Nanos;
use tracing::debug;

use crate::{
    command::{ClientEvent, LabelStr},
    counters::SystemCounters,
    error::ErrorCode,
    publication::PubLifecycle,
    subscribable::Subscribable,
};

pub struct IpcPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub is_exclusive: bool,
    pub log: Arc<LogBuffers>,
    pub subscribable: Subscribable,

    pub_pos: Position,
    pub_lmt: Position,
    term_window_length: usize,
    trip_gain: usize,

    unblock_timeout: Nanos,
    linger_timeout: Nanos,
    liveness_timeout: Nanos,

    state: PubLifecycle,
    ref_count: i32,
    reached_end_of_life: bool,

    consumer_position: i64,
    last_consumer_position: i64,
    time_of_last_consumer_update: Nanos,
    clean_position: i64,
    trip_limit: i64,
    linger_deadline: Nanos,
    cooldown_deadline: Option<Nanos>,
}

#[allow(clippy::too_many_arguments)]
impl IpcPublication {
    pub fn new(
        registration_id: i64,
        channel: String,
        is_exclusive: bool,
        log: Arc<LogBuffers>,
        pub_pos: Position,
        pub_lmt: Position,
        term_window_length: usize,
        unblock_timeout: Nanos,
        linger_timeout: Nanos,
        liveness_timeout: Nanos,
        now: Nanos,
    ) -> Self {
        let producer_position = log.producer_position();
        pub_pos.set_ordered(producer_position);
        pub_lmt.set_ordered(producer_position);
        Self {
            registration_id,
            session_id: log.session_id(),
            stream_id: log.stream_id(),
            channel,
            is_exclusive,
            log,
            subscribable: Subscribable::default(),
            pub_pos,
            pub_lmt,
            term_window_length,
            trip_gain: term_window_length / 8,
            unblock_timeout,
            linger_timeout,
            liveness_timeout,
            state: PubLifecycle::Active,
            ref_count: 1,
            reached_end_of_life: false,
            consumer_position: producer_position,
            last_consumer_position: producer_position,
            time_of_last_consumer_update: now,
            clean_position: producer_position,
            trip_limit: producer_position,
            linger_deadline: Nanos::MAX,
            cooldown_deadline: None,
        }
    }

    #[inline]
    pub fn state(&self) -> PubLifecycle {
        self.state
    }

    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    #[inline]
    pub fn reached_end_of_life(&self) -> bool {
        self.reached_end_of_life
    }

    #[inline]
    pub fn producer_position(&self) -> i64 {
        self.log.producer_position()
    }

    #[inline]
    pub fn publisher_limit_counter_id(&self) -> i32 {
        self.pub_lmt.id()
    }

    /// The publisher position and limit counters, for freeing on removal.
    pub fn position_counters(&self) -> (Position, Position) {
        (self.pub_pos, self.pub_lmt)
    }

    #[inline]
    pub fn consumer_position(&self) -> i64 {
        self.consumer_position
    }

    #[inline]
    pub fn term_window_length(&self) -> usize {
        self.term_window_length
    }

    /// Position a fresh subscriber starts reading from.
    pub fn join_position(&self) -> i64 {
        self.producer_position()
    }

    /// Position an untethered subscriber rejoins at.
    pub fn rejoin_position(&self) -> i64 {
        self.subscribable.min_position().unwrap_or(self.consumer_position)
    }

    /// New subscribers are refused while a rejection cooldown runs.
    pub fn accepting_subscribers(&self, now: Nanos) -> bool {
        self.state == PubLifecycle::Active
            && self.cooldown_deadline.is_none_or(|deadline| now >= deadline)
    }

    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    pub fn dec_ref(&mut self) {
        self.ref_count -= 1;
        if self.ref_count == 0 && self.state == PubLifecycle::Active {
            let producer_position = self.producer_position();
            self.log.set_end_of_stream_position(producer_position);
            self.state = PubLifecycle::Draining;
            debug!(registration_id = self.registration_id, "ipc publication draining");
        }
    }

    pub fn on_time_event(
        &mut self,
        now: Nanos,
        events: &mut Vec<ClientEvent>,
        system: &SystemCounters,
    ) {
        match self.state {
            PubLifecycle::Active => {
                if self.log.is_revoked() {
                    self.on_revoked(now, events);
                } else {
                    self.pub_pos.set_ordered(self.producer_position());
                    if !self.is_exclusive {
                        self.check_blocked_publisher(now, system);
                    }
                }
            }
            PubLifecycle::Draining => {
                let producer_position = self.producer_position();
                self.pub_pos.set_ordered(producer_position);
                let drained = !self.subscribable.has_subscribers()
                    || self.subscribable.min_position().unwrap_or(producer_position)
                        >= producer_position;
                if drained {
                    self.log.set_is_connected(false);
                    self.state = PubLifecycle::Linger;
                    self.linger_deadline = now + self.linger_timeout;
                } else if self.log.unblock(self.consumer_position) {
                    system.unblocked_publications.increment();
                }
            }
            PubLifecycle::Linger => {
                if self.ref_count == 0 && now >= self.linger_deadline {
                    self.disconnect_subscribers(events);
                    self.reached_end_of_life = true;
                    self.state = PubLifecycle::Done;
                }
            }
            PubLifecycle::Done => {}
        }
    }

    fn on_revoked(&mut self, now: Nanos, events: &mut Vec<ClientEvent>) {
        let producer_position = self.producer_position();
        self.pub_lmt.set_ordered(producer_position);
        self.log.set_end_of_stream_position(producer_position);
        self.log.set_is_connected(false);
        self.disconnect_subscribers(events);
        events.push(ClientEvent::PublicationError {
            registration_id: self.registration_id,
            session_id: self.session_id,
            code: ErrorCode::PublicationRevoked,
            message: LabelStr::from_str_truncate("publication revoked"),
        });
        self.state = PubLifecycle::Linger;
        self.linger_deadline = now + self.linger_timeout;
        debug!(
            registration_id = self.registration_id,
            position = producer_position,
            "ipc publication revoked"
        );
    }

    fn disconnect_subscribers(&mut self, events: &mut Vec<ClientEvent>) {
        for subscriber in self.subscribable.positions() {
            events.push(ClientEvent::UnavailableImage {
                correlation_id: self.registration_id,
                subscription_registration_id: subscriber.link_registration_id,
                stream_id: self.stream_id,
            });
        }
    }

    /// Advance the consumer view and, behind the trip hysteresis, the
    /// publisher limit. Cleans consumed bytes before the limit moves.
    pub fn update_publisher_position_and_limit(&mut self, now: Nanos) -> usize {
        if self.state != PubLifecycle::Active {
            return 0;
        }
        let mut work = 0;

        if self.subscribable.has_subscribers() {
            let min_position = self.subscribable.min_position().unwrap_or(self.consumer_position);
            let max_position = self.subscribable.max_position().unwrap_or(self.consumer_position);
            if max_position > self.consumer_position {
                self.consumer_position = max_position;
                self.time_of_last_consumer_update = now;
            }

            let proposed_limit = min_position + self.term_window_length as i64;
            if proposed_limit >= self.trip_limit {
                self.clean_buffer_to(min_position);
                self.pub_lmt.set_ordered(proposed_limit);
                self.trip_limit = proposed_limit + self.trip_gain as i64;
                work += 1;
            }
        } else if self.pub_lmt.get() > self.consumer_position {
            self.trip_limit = self.consumer_position;
            self.pub_lmt.set_ordered(self.consumer_position);
            self.clean_buffer_to(self.consumer_position);
            work += 1;
        }
        work
    }

    /// A concurrent publisher that claimed space and died stalls every
    /// reader at that frame. Once the fastest consumer makes no progress
    /// for the unblock timeout while the producer is ahead, pad it out.
    fn check_blocked_publisher(&mut self, now: Nanos, system: &SystemCounters) {
        if self.consumer_position == self.last_consumer_position
            && self.producer_position() > self.consumer_position
        {
            if now.saturating_sub(self.time_of_last_consumer_update) >= self.unblock_timeout
                && self.log.unblock(self.consumer_position)
            {
                system.unblocked_publications.increment();
                self.time_of_last_consumer_update = now;
            }
        } else {
            self.last_consumer_position = self.consumer_position;
            self.time_of_last_consumer_update = now;
        }
    }

    fn clean_buffer_to(&mut self, position: i64) {
        if position > self.clean_position {
            self.log.clean_between(self.clean_position, position);
            self.clean_position = position;
        }
    }

    /// Client-requested rejection: surface an error, disconnect everyone
    /// and refuse new subscribers until the cooldown passes. Returns the
    /// detached position counters for the conductor to free.
    pub fn reject(
        &mut self,
        position: i64,
        reason: &str,
        now: Nanos,
        events: &mut Vec<ClientEvent>,
        system: &SystemCounters,
    ) -> Vec<Position> {
        self.pub_lmt.set_ordered(position);
        self.log.set_is_connected(false);
        self.disconnect_subscribers(events);
        let freed = self.drain_subscriber_positions();
        events.push(ClientEvent::PublicationError {
            registration_id: self.registration_id,
            session_id: self.session_id,
            code: ErrorCode::ImageRejected,
            message: LabelStr::from_str_truncate(reason),
        });
        system.images_rejected.increment();
        self.cooldown_deadline = Some(now + self.liveness_timeout);
        freed
    }

    /// Detach every subscriber, handing back their position counters.
    pub fn drain_subscriber_positions(&mut self) -> Vec<Position> {
        let links: Vec<i64> = self
            .subscribable
            .positions()
            .iter()
            .map(|p| p.link_registration_id)
            .collect();
        let mut freed = Vec::new();
        for link in links {
            freed.extend(self.subscribable.remove_subscriber(link));
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use sluice_logbuffer::{
        CounterTable, MappedRegion, METADATA_RECORD_LENGTH, NULL_REGISTRATION_ID,
        VALUE_RECORD_LENGTH,
    };

    use super::*;
    use crate::subscribable::UntetheredTimeouts;

    const TERM_LENGTH: usize = 64 * 1024;
    const WINDOW: usize = TERM_LENGTH / 2;

    struct Fixture {
        _region: MappedRegion,
        table: CounterTable,
        system: SystemCounters,
    }

    fn fixture() -> Fixture {
        let region = MappedRegion::heap(64 * (METADATA_RECORD_LENGTH + VALUE_RECORD_LENGTH));
        let table = CounterTable::new(
            region.buffer(0, 64 * METADATA_RECORD_LENGTH),
            region.buffer(64 * METADATA_RECORD_LENGTH, 64 * VALUE_RECORD_LENGTH),
            Nanos::ZERO,
        );
        let system = SystemCounters::allocate(&table, Nanos(1)).unwrap();
        Fixture { _region: region, table, system }
    }

    fn publication(f: &Fixture) -> IpcPublication {
        let log = Arc::new(LogBuffers::create_unshared(TERM_LENGTH).unwrap());
        log.initialize(0, 0, 0, 1408, 4096, 7, 1001, 1);
        let pub_pos = counter(f);
        let pub_lmt = counter(f);
        IpcPublication::new(
            1,
            "sluice:ipc".to_string(),
            false,
            log,
            pub_pos,
            pub_lmt,
            WINDOW,
            Nanos::from_millis(10),
            Nanos::from_millis(20),
            Nanos::from_millis(50),
            Nanos(0),
        )
    }

    fn counter(f: &Fixture) -> Position {
        let id = f.table.allocate(4, b"", "c", NULL_REGISTRATION_ID, 1, Nanos(1)).unwrap();
        f.table.position(id)
    }

    fn add_subscriber(f: &Fixture, publication: &mut IpcPublication, link: i64) -> Position {
        let position = counter(f);
        position.set_ordered(publication.join_position());
        publication.subscribable.add_subscriber(
            link,
            position,
            true,
            true,
            UntetheredTimeouts {
                window_limit: Nanos::from_millis(5),
                linger: Nanos::from_millis(5),
                resting: Nanos::from_millis(5),
            },
            Nanos(0),
        );
        position
    }

    #[test]
    fn limit_tracks_slowest_subscriber_with_hysteresis() {
        let f = fixture();
        let mut publication = publication(&f);
        let sub = add_subscriber(&f, &mut publication, 10);

        publication.update_publisher_position_and_limit(Nanos(1));
        assert_eq!(publication.pub_lmt.get(), WINDOW as i64);

        // a small advance stays inside the trip gain: limit unchanged
        sub.set_ordered(64);
        publication.update_publisher_position_and_limit(Nanos(2));
        assert_eq!(publication.pub_lmt.get(), WINDOW as i64);

        // past the trip gain the limit is republished
        let trip = WINDOW as i64 / 8;
        sub.set_ordered(trip + 64);
        publication.update_publisher_position_and_limit(Nanos(3));
        assert_eq!(publication.pub_lmt.get(), trip + 64 + WINDOW as i64);
    }

    #[test]
    fn no_subscribers_pins_limit_to_consumer_position() {
        let f = fixture();
        let mut publication = publication(&f);
        let sub = add_subscriber(&f, &mut publication, 10);
        publication.update_publisher_position_and_limit(Nanos(1));

        // writer fills some of the window
        for _ in 0..4 {
            publication
                .log
                .append_unfragmented(&[0u8; 16], publication.pub_lmt.get_volatile(), false)
                .unwrap();
        }
        sub.set_ordered(192);
        publication.update_publisher_position_and_limit(Nanos(2));
        assert_eq!(publication.consumer_position(), 192);

        publication.subscribable.remove_subscriber(10);
        publication.update_publisher_position_and_limit(Nanos(3));
        assert_eq!(publication.pub_lmt.get(), 192);
    }

    #[test]
    fn ten_ipc_messages_observed_at_expected_positions() {
        let f = fixture();
        let mut publication = publication(&f);
        add_subscriber(&f, &mut publication, 10);
        publication.update_publisher_position_and_limit(Nanos(1));

        for i in 0..10u8 {
            publication
                .log
                .append_unfragmented(&[i; 16], publication.pub_lmt.get_volatile(), false)
                .unwrap();
        }

        // reader walks the term observing each fragment position
        let log = &publication.log;
        let term = log.term_buffer(0);
        let mut position = 0i64;
        let mut observed = Vec::new();
        loop {
            let offset = position as usize;
            let frame_length = sluice_logbuffer::frame::frame_length_volatile(&term, offset);
            if frame_length <= 0 {
                break;
            }
            observed.push(position);
            position += i64::from(sluice_logbuffer::frame::aligned_length(frame_length as usize) as i32);
        }
        assert_eq!(observed, vec![0, 48, 96, 144, 192, 240, 288, 336, 384, 432]);
    }

    #[test]
    fn revocation_ends_stream_within_one_tick() {
        let f = fixture();
        let mut publication = publication(&f);
        add_subscriber(&f, &mut publication, 10);
        publication.update_publisher_position_and_limit(Nanos(1));
        publication.log.set_is_connected(true);

        // writer reaches position 4096 then revokes
        let mut written = 0i64;
        while written < 4096 {
            publication
                .log
                .append_unfragmented(&[0u8; 96], publication.pub_lmt.get_volatile(), false)
                .unwrap();
            written += 128;
        }
        publication.log.revoke();

        let mut events = Vec::new();
        publication.on_time_event(Nanos(10), &mut events, &f.system);

        assert_eq!(publication.state(), PubLifecycle::Linger);
        assert!(!publication.log.is_connected());
        assert_eq!(publication.log.end_of_stream_position(), 4096);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::PublicationError { code: ErrorCode::PublicationRevoked, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::UnavailableImage { subscription_registration_id: 10, .. }
        )));

        // after the linger timeout with no refs the log can be freed
        publication.dec_ref();
        publication.on_time_event(Nanos(10) + Nanos::from_millis(21), &mut events, &f.system);
        assert_eq!(publication.state(), PubLifecycle::Done);
        assert!(publication.reached_end_of_life());
    }

    #[test]
    fn blocked_publisher_is_unblocked_after_timeout() {
        let f = fixture();
        let mut publication = publication(&f);
        add_subscriber(&f, &mut publication, 10);
        publication.update_publisher_position_and_limit(Nanos(1));

        // a writer claims 256 bytes of term space and dies before commit
        let limit = publication.pub_lmt.get_volatile();
        assert!(matches!(
            publication.log.claim(224, limit, false),
            Ok(sluice_logbuffer::Claim::Claimed { .. })
        ));

        let t0 = Nanos::from_millis(100);
        let mut events = Vec::new();
        publication.on_time_event(t0, &mut events, &f.system);

        // consumer still stuck at 0 after the unblock timeout
        let t1 = t0 + Nanos::from_millis(11);
        publication.on_time_event(t1, &mut events, &f.system);

        assert_eq!(f.table.position(f.system.unblocked_publications.id()).get(), 1);
        let term = publication.log.term_buffer(0);
        assert!(sluice_logbuffer::frame::is_padding(&term, 0));
        assert_eq!(sluice_logbuffer::frame::frame_length_volatile(&term, 0), 256);
    }

    #[test]
    fn drain_linger_done() {
        let f = fixture();
        let mut publication = publication(&f);
        let sub = add_subscriber(&f, &mut publication, 10);
        publication.update_publisher_position_and_limit(Nanos(1));
        publication
            .log
            .append_unfragmented(&[0u8; 16], publication.pub_lmt.get_volatile(), false)
            .unwrap();

        publication.dec_ref();
        assert_eq!(publication.state(), PubLifecycle::Draining);
        assert_eq!(publication.log.end_of_stream_position(), 48);

        // subscriber not caught up: still draining
        let mut events = Vec::new();
        publication.on_time_event(Nanos(2), &mut events, &f.system);
        assert_eq!(publication.state(), PubLifecycle::Draining);

        sub.set_ordered(48);
        publication.on_time_event(Nanos(3), &mut events, &f.system);
        assert_eq!(publication.state(), PubLifecycle::Linger);

        publication.on_time_event(Nanos(3) + Nanos::from_millis(21), &mut events, &f.system);
        assert_eq!(publication.state(), PubLifecycle::Done);
    }

    #[test]
    fn reject_enters_cooldown() {
        let f = fixture();
        let mut publication = publication(&f);
        add_subscriber(&f, &mut publication, 10);

        let mut events = Vec::new();
        publication.reject(0, "bad data", Nanos(5), &mut events, &f.system);

        assert!(!publication.accepting_subscribers(Nanos(6)));
        assert!(publication.accepting_subscribers(Nanos(5) + Nanos::from_millis(51)));
        assert!(!publication.subscribable.has_subscribers());
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::PublicationError { code: ErrorCode::ImageRejected, .. }
        )));
        assert_eq!(f.table.position(f.system.images_rejected.id()).get(), 1);
    }
}
