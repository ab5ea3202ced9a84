//! Sender-side network publication.
//!
//! The conductor owns the lifecycle object; the sender owns the send loop,
//! flow control and retransmits. They share one `PubState` of single-writer
//! atomics: the sender only ever writes `snd_pos`, `snd_lmt` and activity
//! flags, the conductor everything else.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
};

use sluice_logbuffer::{
    AtomicBuffer, LogBuffers, Position, descriptor,
    frame::{self, FrameFlags, FrameType, HEADER_LENGTH, SEND_SETUP_FLAG},
};
use sluice_timing::Nanos;
use tracing::debug;

use crate::{
    command::{ClientEvent, LabelStr},
    counters::SystemCounters,
    error::ErrorCode,
    feedback::FeedbackDelay,
    flow_control::FlowControl,
    protocol::{self, NakMessage, RttMeasurement, SetupMessage, StatusMessage},
    publication::PubLifecycle,
    subscribable::Subscribable,
    transport::ChannelTransport,
};

pub const SETUP_TIMEOUT: Nanos = Nanos::from_millis(100);
pub const HEARTBEAT_TIMEOUT: Nanos = Nanos::from_millis(100);
pub const MAX_MESSAGES_PER_SEND: usize = 2;
const FEEDBACK_POLL_LIMIT: usize = 16;

/// Fields shared between the conductor and the sender.
pub struct PubState {
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub position_bits_to_shift: u32,
    pub mtu_length: usize,
    pub log: Arc<LogBuffers>,

    pub pub_pos: Position,
    pub pub_lmt: Position,
    pub snd_pos: Position,
    pub snd_lmt: Position,

    pub has_receivers: AtomicBool,
    pub has_initial_connection: AtomicBool,
    pub time_of_last_activity: AtomicU64,
    pub end_of_stream: AtomicBool,
    pub end_of_stream_position: AtomicI64,
    /// Highest consumption position seen in any status message.
    pub sm_position: AtomicI64,
    pub sender_released: AtomicBool,
}

impl PubState {
    pub fn new(
        log: Arc<LogBuffers>,
        pub_pos: Position,
        pub_lmt: Position,
        snd_pos: Position,
        snd_lmt: Position,
    ) -> Arc<Self> {
        let start = log.producer_position();
        pub_pos.set_ordered(start);
        pub_lmt.set_ordered(start);
        snd_pos.set_ordered(start);
        Arc::new(Self {
            session_id: log.session_id(),
            stream_id: log.stream_id(),
            initial_term_id: log.initial_term_id(),
            term_length: log.term_length(),
            position_bits_to_shift: log.position_bits_to_shift(),
            mtu_length: log.mtu_length(),
            log,
            pub_pos,
            pub_lmt,
            snd_pos,
            snd_lmt,
            has_receivers: AtomicBool::new(false),
            has_initial_connection: AtomicBool::new(false),
            time_of_last_activity: AtomicU64::new(0),
            end_of_stream: AtomicBool::new(false),
            end_of_stream_position: AtomicI64::new(i64::MAX),
            sm_position: AtomicI64::new(start),
            sender_released: AtomicBool::new(false),
        })
    }
}

// --- retransmits ---

#[derive(Clone, Copy, Debug)]
struct RetransmitAction {
    term_id: i32,
    term_offset: i32,
    length: i32,
    deadline: Nanos,
    lingering: bool,
}

/// Schedules resends for NAKed ranges. Overlapping requests while an
/// action is pending or lingering are suppressed so one loss burst
/// produces one retransmit.
pub struct RetransmitHandler {
    actions: Vec<RetransmitAction>,
    delay_generator: FeedbackDelay,
    linger_timeout: Nanos,
    max_actions: usize,
}

impl RetransmitHandler {
    pub fn new(delay_generator: FeedbackDelay, linger_timeout: Nanos, max_actions: usize) -> Self {
        Self { actions: Vec::new(), delay_generator, linger_timeout, max_actions }
    }

    /// Returns true when the NAK scheduled a new action.
    pub fn on_nak(&mut self, term_id: i32, term_offset: i32, length: i32, now: Nanos) -> bool {
        let overlaps = self.actions.iter().any(|a| {
            a.term_id == term_id
                && term_offset < a.term_offset + a.length
                && a.term_offset < term_offset + length
        });
        if overlaps || self.actions.len() >= self.max_actions {
            return false;
        }
        self.actions.push(RetransmitAction {
            term_id,
            term_offset,
            length,
            deadline: now + self.delay_generator.delay(0),
            lingering: false,
        });
        true
    }

    /// Actions whose delay expired; they linger (still suppressing
    /// duplicates) until the linger timeout passes.
    pub fn take_due(&mut self, now: Nanos) -> Vec<(i32, i32, i32)> {
        let mut due = Vec::new();
        for action in &mut self.actions {
            if !action.lingering && now >= action.deadline {
                action.lingering = true;
                action.deadline = now + self.linger_timeout;
                due.push((action.term_id, action.term_offset, action.length));
            }
        }
        self.actions.retain(|a| !(a.lingering && now >= a.deadline));
        due
    }
}

// --- sender side ---

pub struct SenderPublication {
    pub registration_id: i64,
    state: Arc<PubState>,
    transport: Arc<dyn ChannelTransport>,
    destinations: Vec<SocketAddr>,
    flow_control: FlowControl,
    retransmit: RetransmitHandler,
    counters: SystemCounters,
    setup_deadline: Nanos,
    heartbeat_deadline: Nanos,
    setup_elicited: bool,
}

impl SenderPublication {
    pub fn new(
        registration_id: i64,
        state: Arc<PubState>,
        transport: Arc<dyn ChannelTransport>,
        destination: Option<SocketAddr>,
        flow_control: FlowControl,
        retransmit: RetransmitHandler,
        initial_window_length: usize,
        counters: SystemCounters,
    ) -> Self {
        state
            .snd_lmt
            .set_ordered(state.snd_pos.get() + initial_window_length as i64);
        Self {
            registration_id,
            state,
            transport,
            destinations: destination.into_iter().collect(),
            flow_control,
            retransmit,
            counters,
            setup_deadline: Nanos::ZERO,
            heartbeat_deadline: Nanos::ZERO,
            setup_elicited: false,
        }
    }

    #[inline]
    pub fn state(&self) -> &Arc<PubState> {
        &self.state
    }

    pub fn add_destination(&mut self, destination: SocketAddr) {
        if !self.destinations.contains(&destination) {
            self.destinations.push(destination);
        }
    }

    pub fn remove_destination(&mut self, destination: SocketAddr) {
        self.destinations.retain(|d| *d != destination);
    }

    /// One sender duty cycle for this publication.
    pub fn do_work(&mut self, now: Nanos) -> usize {
        let mut work = self.poll_feedback(now);
        work += self.send_data(now);
        self.check_timers(now);
        work
    }

    /// Drop the publication from the send loop; the conductor frees the
    /// log once this lands.
    pub fn release(&self) {
        self.state.sender_released.store(true, Ordering::Release);
    }

    fn poll_feedback(&mut self, now: Nanos) -> usize {
        let mut status_messages: Vec<(StatusMessage, SocketAddr)> = Vec::new();
        let mut naks: Vec<NakMessage> = Vec::new();

        let polled = self.transport.poll(FEEDBACK_POLL_LIMIT, &mut |datagram, src| {
            match protocol::classify(datagram) {
                Some(FrameType::StatusMessage) => {
                    if let Some(sm) = StatusMessage::decode(datagram) {
                        status_messages.push((sm, src));
                    }
                }
                Some(FrameType::Nak) => {
                    if let Some(nak) = NakMessage::decode(datagram) {
                        naks.push(nak);
                    }
                }
                Some(FrameType::Rtt) => {
                    if let Some(rtt) = RttMeasurement::decode(datagram) {
                        if rtt.is_reply {
                            tracing::trace!(
                                receiver_id = rtt.receiver_id,
                                echo_timestamp_ns = rtt.echo_timestamp_ns,
                                "rtt reply"
                            );
                        }
                    }
                }
                _ => {}
            }
        });

        for (sm, src) in status_messages {
            if sm.session_id == self.state.session_id && sm.stream_id == self.state.stream_id {
                self.on_status_message(&sm, src, now);
            }
        }
        for nak in naks {
            if nak.session_id == self.state.session_id && nak.stream_id == self.state.stream_id {
                self.on_nak(&nak, now);
            }
        }
        polled
    }

    fn on_status_message(&mut self, sm: &StatusMessage, src: SocketAddr, now: Nanos) {
        self.counters.status_messages_received.increment();
        self.state.has_receivers.store(true, Ordering::Release);
        self.state.has_initial_connection.store(true, Ordering::Release);
        if sm.flags & SEND_SETUP_FLAG != 0 {
            self.setup_elicited = true;
        }

        let position = descriptor::compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            self.state.position_bits_to_shift,
            self.state.initial_term_id,
        );
        self.state.sm_position.fetch_max(position, Ordering::AcqRel);

        let limit = self.flow_control.on_status_message(
            sm,
            src,
            self.state.initial_term_id,
            self.state.position_bits_to_shift,
            self.state.snd_lmt.get(),
            now,
        );
        self.state.snd_lmt.set_ordered(limit);
    }

    fn on_nak(&mut self, nak: &NakMessage, now: Nanos) {
        self.counters.naks_received.increment();
        self.retransmit.on_nak(nak.term_id, nak.term_offset, nak.length, now);
    }

    fn send_data(&mut self, now: Nanos) -> usize {
        let mut work = 0;
        for _ in 0..MAX_MESSAGES_PER_SEND {
            let snd_pos = self.state.snd_pos.get();
            let limit = self.state.snd_lmt.get_volatile();
            let (send_bytes, advance) = self.scan_available(snd_pos, limit);
            if advance == 0 {
                break;
            }

            let index = descriptor::index_by_position(snd_pos, self.state.position_bits_to_shift);
            let offset = descriptor::compute_term_offset_from_position(
                snd_pos,
                self.state.position_bits_to_shift,
            ) as usize;
            let term = self.state.log.term_buffer(index);
            let datagram = term.slice(offset, send_bytes);

            if !self.transmit(datagram) {
                self.counters.short_sends.increment();
                break;
            }

            self.counters.bytes_sent.add(send_bytes as i64);
            self.state.snd_pos.set_ordered(snd_pos + advance as i64);
            self.state.time_of_last_activity.store(now.0, Ordering::Release);
            self.heartbeat_deadline = now + HEARTBEAT_TIMEOUT;
            work += 1;
        }
        work
    }

    /// Walk committed frames from `position`: bytes to put on the wire and
    /// bytes of stream to advance. Padding advances its whole extent but
    /// only its header is transmitted.
    fn scan_available(&self, position: i64, limit: i64) -> (usize, usize) {
        let bits = self.state.position_bits_to_shift;
        let term = self
            .state
            .log
            .term_buffer(descriptor::index_by_position(position, bits));
        let start = descriptor::compute_term_offset_from_position(position, bits) as usize;
        let term_length = self.state.term_length;
        let mtu = self.state.mtu_length;

        let mut scan = start;
        loop {
            if scan >= term_length {
                break;
            }
            let frame_length = frame::frame_length_volatile(&term, scan);
            if frame_length <= 0 {
                break;
            }
            let aligned = frame::aligned_length(frame_length as usize);
            if position + (scan - start + aligned) as i64 > limit {
                break;
            }
            if frame::is_padding(&term, scan) {
                if scan == start {
                    // header only on the wire, whole extent off the stream
                    return (HEADER_LENGTH, aligned);
                }
                break;
            }
            // a single frame larger than the MTU still goes out, alone
            if scan - start + aligned > mtu && scan != start {
                break;
            }
            scan += aligned;
            if scan - start >= mtu {
                break;
            }
        }
        (scan - start, scan - start)
    }

    /// Best-effort fan-out. An empty destination set (manual control mode
    /// before any destination is added) counts as sent so the stream does
    /// not back up behind nobody.
    fn transmit(&self, datagram: &[u8]) -> bool {
        let mut ok = true;
        for destination in &self.destinations {
            if self.transport.send_to(datagram, *destination) < datagram.len() {
                ok = false;
            }
        }
        ok
    }

    fn check_timers(&mut self, now: Nanos) {
        let connected = self.state.has_initial_connection.load(Ordering::Acquire);
        if (!connected && now >= self.setup_deadline) || self.setup_elicited {
            self.send_setup();
            self.setup_deadline = now + SETUP_TIMEOUT;
            self.setup_elicited = false;
        }

        if connected && now >= self.heartbeat_deadline {
            self.send_heartbeat();
            self.state.time_of_last_activity.store(now.0, Ordering::Release);
            self.heartbeat_deadline = now + HEARTBEAT_TIMEOUT;
        }

        for (term_id, term_offset, length) in self.retransmit.take_due(now) {
            self.resend(term_id, term_offset, length);
        }

        let limit = self.flow_control.on_idle(now, self.state.snd_lmt.get());
        self.state.snd_lmt.set_ordered(limit);
        if !self.flow_control.has_receivers() {
            self.state.has_receivers.store(false, Ordering::Release);
        }
    }

    fn send_setup(&self) {
        let snd_pos = self.state.snd_pos.get();
        let bits = self.state.position_bits_to_shift;
        let setup = SetupMessage {
            term_offset: descriptor::compute_term_offset_from_position(snd_pos, bits),
            session_id: self.state.session_id,
            stream_id: self.state.stream_id,
            initial_term_id: self.state.initial_term_id,
            active_term_id: descriptor::compute_term_id_from_position(
                snd_pos,
                bits,
                self.state.initial_term_id,
            ),
            term_length: self.state.term_length as i32,
            mtu_length: self.state.mtu_length as i32,
            ttl: 0,
        };
        let mut buf = [0u8; protocol::SETUP_LENGTH];
        let len = setup.encode(&mut buf);
        self.transmit(&buf[..len]);
    }

    /// Zero-length data frame carrying the current stream position, with
    /// the EOS flag once the stream has ended and fully drained out.
    fn send_heartbeat(&self) {
        let snd_pos = self.state.snd_pos.get();
        let bits = self.state.position_bits_to_shift;
        let mut flags = FrameFlags::UNFRAGMENTED;
        if self.state.end_of_stream.load(Ordering::Acquire)
            && snd_pos >= self.state.end_of_stream_position.load(Ordering::Acquire)
        {
            flags |= FrameFlags::EOS;
        }

        let mut raw = [0u8; HEADER_LENGTH];
        let buf = AtomicBuffer::new(raw.as_mut_ptr(), raw.len());
        frame::write_header(
            &buf,
            0,
            flags,
            FrameType::Data,
            descriptor::compute_term_offset_from_position(snd_pos, bits),
            self.state.session_id,
            self.state.stream_id,
            descriptor::compute_term_id_from_position(snd_pos, bits, self.state.initial_term_id),
        );
        buf.put_i32(0, HEADER_LENGTH as i32);
        if self.transmit(&raw) {
            self.counters.heartbeats_sent.increment();
        }
    }

    /// Retransmit a NAKed range, chunked by MTU. Only ranges already sent
    /// and still within one term of the sender position are served.
    fn resend(&mut self, term_id: i32, term_offset: i32, length: i32) {
        let bits = self.state.position_bits_to_shift;
        let initial = self.state.initial_term_id;
        let position = descriptor::compute_position(term_id, term_offset, bits, initial);
        let snd_pos = self.state.snd_pos.get();
        if position >= snd_pos || position < snd_pos - self.state.term_length as i64 {
            return;
        }

        let index = descriptor::index_by_term(initial, term_id);
        let term = self.state.log.term_buffer(index);
        let term_length = self.state.term_length;
        let mut offset = term_offset as usize;
        let end = (term_offset as usize + length as usize).min(term_length);

        while offset < end {
            let frame_length = frame::frame_length_volatile(&term, offset);
            if frame_length <= 0 {
                break;
            }
            let mut chunk = 0usize;
            while offset + chunk < end && chunk < self.state.mtu_length {
                let frame_length = frame::frame_length_volatile(&term, offset + chunk);
                if frame_length <= 0 {
                    break;
                }
                let aligned = frame::aligned_length(frame_length as usize);
                if chunk + aligned > self.state.mtu_length && chunk > 0 {
                    break;
                }
                chunk += aligned;
            }
            if chunk == 0 {
                break;
            }
            if !self.transmit(term.slice(offset, chunk)) {
                self.counters.short_sends.increment();
                return;
            }
            offset += chunk;
        }
        self.counters.retransmits_sent.increment();
    }
}

// --- conductor side ---

pub struct NetworkPublication {
    pub registration_id: i64,
    pub channel: String,
    pub is_exclusive: bool,
    pub shared: Arc<PubState>,
    pub spy_subscribable: Subscribable,
    pub spies_simulate_connection: bool,

    lifecycle: PubLifecycle,
    ref_count: i32,
    reached_end_of_life: bool,

    term_window_length: usize,
    trip_gain: usize,
    trip_limit: i64,
    clean_position: i64,

    last_snd_pos: i64,
    time_of_last_consumer_update: Nanos,
    unblock_timeout: Nanos,
    linger_timeout: Nanos,
    linger_deadline: Nanos,
    drain_deadline: Nanos,
}

impl NetworkPublication {
    pub fn new(
        registration_id: i64,
        channel: String,
        is_exclusive: bool,
        shared: Arc<PubState>,
        term_window_length: usize,
        spies_simulate_connection: bool,
        unblock_timeout: Nanos,
        linger_timeout: Nanos,
        now: Nanos,
    ) -> Self {
        let start = shared.snd_pos.get();
        Self {
            registration_id,
            channel,
            is_exclusive,
            shared,
            spy_subscribable: Subscribable::default(),
            spies_simulate_connection,
            lifecycle: PubLifecycle::Active,
            ref_count: 1,
            reached_end_of_life: false,
            term_window_length,
            trip_gain: term_window_length / 8,
            trip_limit: start,
            clean_position: start,
            last_snd_pos: start,
            time_of_last_consumer_update: now,
            unblock_timeout,
            linger_timeout,
            linger_deadline: Nanos::MAX,
            drain_deadline: Nanos::MAX,
        }
    }

    #[inline]
    pub fn state(&self) -> PubLifecycle {
        self.lifecycle
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        self.shared.session_id
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.shared.stream_id
    }

    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    #[inline]
    pub fn reached_end_of_life(&self) -> bool {
        self.reached_end_of_life && self.shared.sender_released.load(Ordering::Acquire)
    }

    #[inline]
    pub fn log(&self) -> &Arc<LogBuffers> {
        &self.shared.log
    }

    #[inline]
    pub fn term_window_length(&self) -> usize {
        self.term_window_length
    }

    pub fn producer_position(&self) -> i64 {
        self.shared.log.producer_position()
    }

    /// Spies join at the live edge.
    pub fn join_position(&self) -> i64 {
        self.producer_position()
    }

    pub fn rejoin_position(&self) -> i64 {
        self.spy_subscribable
            .min_position()
            .unwrap_or_else(|| self.shared.snd_pos.get_volatile())
    }

    pub fn accepting_subscribers(&self, _now: Nanos) -> bool {
        self.lifecycle == PubLifecycle::Active
    }

    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    pub fn dec_ref(&mut self, now: Nanos) {
        self.ref_count -= 1;
        if self.ref_count == 0 && self.lifecycle == PubLifecycle::Active {
            let eos_position = self.producer_position();
            self.shared.log.set_end_of_stream_position(eos_position);
            self.shared.end_of_stream_position.store(eos_position, Ordering::Release);
            self.shared.end_of_stream.store(true, Ordering::Release);
            self.drain_deadline = now + self.linger_timeout;
            self.lifecycle = PubLifecycle::Draining;
            debug!(registration_id = self.registration_id, "network publication draining");
        }
    }

    pub fn on_time_event(
        &mut self,
        now: Nanos,
        events: &mut Vec<ClientEvent>,
        system: &SystemCounters,
    ) {
        match self.lifecycle {
            PubLifecycle::Active => {
                if self.shared.log.is_revoked() {
                    self.on_revoked(now, events);
                } else {
                    self.check_blocked_publisher(now, system);
                }
            }
            PubLifecycle::Draining => {
                let snd_pos = self.shared.snd_pos.get_volatile();
                let eos = self.shared.end_of_stream_position.load(Ordering::Acquire);
                let sent_to_eos = snd_pos >= eos;
                let receivers_past_eos = !self.shared.has_receivers.load(Ordering::Acquire)
                    || self.shared.sm_position.load(Ordering::Acquire) >= eos
                    || now >= self.drain_deadline;
                let spies_done = self
                    .spy_subscribable
                    .min_position()
                    .is_none_or(|min| min >= eos);
                if sent_to_eos && receivers_past_eos && spies_done {
                    self.shared.log.set_is_connected(false);
                    self.lifecycle = PubLifecycle::Linger;
                    self.linger_deadline = now + self.linger_timeout;
                }
            }
            PubLifecycle::Linger => {
                if self.ref_count == 0 && now >= self.linger_deadline {
                    self.disconnect_spies(events);
                    self.reached_end_of_life = true;
                    self.lifecycle = PubLifecycle::Done;
                }
            }
            PubLifecycle::Done => {}
        }
    }

    fn on_revoked(&mut self, now: Nanos, events: &mut Vec<ClientEvent>) {
        let producer_position = self.producer_position();
        self.shared.pub_lmt.set_ordered(producer_position);
        self.shared.log.set_end_of_stream_position(producer_position);
        self.shared.end_of_stream_position.store(producer_position, Ordering::Release);
        self.shared.end_of_stream.store(true, Ordering::Release);
        self.shared.log.set_is_connected(false);
        self.disconnect_spies(events);
        events.push(ClientEvent::PublicationError {
            registration_id: self.registration_id,
            session_id: self.shared.session_id,
            code: ErrorCode::PublicationRevoked,
            message: LabelStr::from_str_truncate("publication revoked"),
        });
        self.lifecycle = PubLifecycle::Linger;
        self.linger_deadline = now + self.linger_timeout;
        self.drain_deadline = now;
    }

    fn disconnect_spies(&mut self, events: &mut Vec<ClientEvent>) {
        for spy in self.spy_subscribable.positions() {
            events.push(ClientEvent::UnavailableImage {
                correlation_id: self.registration_id,
                subscription_registration_id: spy.link_registration_id,
                stream_id: self.shared.stream_id,
            });
        }
    }

    pub fn drain_spy_positions(&mut self) -> Vec<Position> {
        let links: Vec<i64> = self
            .spy_subscribable
            .positions()
            .iter()
            .map(|p| p.link_registration_id)
            .collect();
        let mut freed = Vec::new();
        for link in links {
            freed.extend(self.spy_subscribable.remove_subscriber(link));
        }
        freed
    }

    /// Publisher limit follows `min(senderPosition, spyPositions)` so both
    /// the wire and local spies throttle the writer.
    pub fn update_publisher_position_and_limit(&mut self, _now: Nanos) -> usize {
        if self.lifecycle == PubLifecycle::Done {
            return 0;
        }
        let mut work = 0;
        let producer_position = self.producer_position();
        self.shared.pub_pos.set_ordered(producer_position);

        let snd_pos = self.shared.snd_pos.get_volatile();
        let min_consumer = self
            .spy_subscribable
            .min_position()
            .map_or(snd_pos, |spy_min| spy_min.min(snd_pos));

        let connected = self.shared.has_receivers.load(Ordering::Acquire)
            || (self.spies_simulate_connection && self.spy_subscribable.has_subscribers());
        self.shared.log.set_is_connected(connected);

        let proposed_limit = min_consumer + self.term_window_length as i64;
        if proposed_limit >= self.trip_limit {
            self.clean_buffer_to(min_consumer);
            self.shared.pub_lmt.set_ordered(proposed_limit);
            self.trip_limit = proposed_limit + self.trip_gain as i64;
            work += 1;
        }
        work
    }

    fn check_blocked_publisher(&mut self, now: Nanos, system: &SystemCounters) {
        let snd_pos = self.shared.snd_pos.get_volatile();
        if snd_pos == self.last_snd_pos && self.producer_position() > snd_pos {
            if now.saturating_sub(self.time_of_last_consumer_update) >= self.unblock_timeout
                && self.shared.log.unblock(snd_pos)
            {
                system.unblocked_publications.increment();
                self.time_of_last_consumer_update = now;
            }
        } else {
            self.last_snd_pos = snd_pos;
            self.time_of_last_consumer_update = now;
        }
    }

    fn clean_buffer_to(&mut self, position: i64) {
        if position > self.clean_position {
            self.shared.log.clean_between(self.clean_position, position);
            self.clean_position = position;
        }
    }
}

#[cfg(test)]
mod tests {
    use sluice_logbuffer::{
        CounterTable, MappedRegion, METADATA_RECORD_LENGTH, NULL_REGISTRATION_ID,
        VALUE_RECORD_LENGTH,
    };

    use super::*;
    use crate::{
        channel::FcOptions,
        transport::{ChannelTransport, LoopbackHub},
    };

    const TERM_LENGTH: usize = 64 * 1024;

    struct Fixture {
        _region: MappedRegion,
        table: CounterTable,
        system: SystemCounters,
        hub: LoopbackHub,
    }

    fn fixture() -> Fixture {
        let region = MappedRegion::heap(64 * (METADATA_RECORD_LENGTH + VALUE_RECORD_LENGTH));
        let table = CounterTable::new(
            region.buffer(0, 64 * METADATA_RECORD_LENGTH),
            region.buffer(64 * METADATA_RECORD_LENGTH, 64 * VALUE_RECORD_LENGTH),
            Nanos::ZERO,
        );
        let system = SystemCounters::allocate(&table, Nanos(1)).unwrap();
        Fixture { _region: region, table, system, hub: LoopbackHub::default() }
    }

    fn counter(f: &Fixture) -> Position {
        let id = f.table.allocate(2, b"", "c", NULL_REGISTRATION_ID, 1, Nanos(1)).unwrap();
        f.table.position(id)
    }

    fn pub_state(f: &Fixture) -> Arc<PubState> {
        let log = Arc::new(LogBuffers::create_unshared(TERM_LENGTH).unwrap());
        log.initialize(0, 0, 0, 1408, 4096, 7, 1001, 1);
        PubState::new(log, counter(f), counter(f), counter(f), counter(f))
    }

    fn sender_publication(
        f: &Fixture,
        state: Arc<PubState>,
        destination: SocketAddr,
    ) -> SenderPublication {
        SenderPublication::new(
            1,
            state,
            f.hub.bind_ephemeral(),
            Some(destination),
            FlowControl::from_options(&FcOptions::default(), Nanos::from_secs(5)),
            RetransmitHandler::new(FeedbackDelay::immediate(), Nanos::from_millis(10), 16),
            128 * 1024,
            f.system,
        )
    }

    fn drain(
        transport: &Arc<dyn ChannelTransport>,
    ) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut frames = Vec::new();
        transport.poll(64, &mut |frame, src| frames.push((frame.to_vec(), src)));
        frames
    }

    #[test]
    fn sends_setup_until_status_message_arrives() {
        let f = fixture();
        let receiver = f.hub.bind("127.0.0.1:41000").unwrap();
        let state = pub_state(&f);
        let mut publication = sender_publication(&f, state.clone(), receiver.local_addr());

        publication.do_work(Nanos(1));
        let frames = drain(&receiver);
        assert!(
            frames
                .iter()
                .any(|(d, _)| protocol::classify(d) == Some(FrameType::Setup))
        );

        // setup repeats after the timeout
        publication.do_work(Nanos(1) + SETUP_TIMEOUT + Nanos(1));
        assert!(!drain(&receiver).is_empty());
    }

    #[test]
    fn data_flows_and_sender_position_advances() {
        let f = fixture();
        let receiver = f.hub.bind("127.0.0.1:41001").unwrap();
        let state = pub_state(&f);
        let mut publication = sender_publication(&f, state.clone(), receiver.local_addr());

        state.log.append_unfragmented(b"network bytes", i64::MAX, true).unwrap();
        publication.do_work(Nanos(1));

        assert_eq!(state.snd_pos.get(), 64);
        let frames = drain(&receiver);
        let data: Vec<_> = frames
            .iter()
            .filter(|(d, _)| protocol::classify(d) == Some(FrameType::Data))
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(&data[0].0[HEADER_LENGTH..HEADER_LENGTH + 13], b"network bytes");
    }

    #[test]
    fn status_message_lifts_sender_limit() {
        let f = fixture();
        let receiver = f.hub.bind("127.0.0.1:41002").unwrap();
        let state = pub_state(&f);
        let mut publication = sender_publication(&f, state.clone(), receiver.local_addr());
        let initial_limit = state.snd_lmt.get();

        let sm = StatusMessage {
            session_id: 7,
            stream_id: 1001,
            consumption_term_id: 0,
            consumption_term_offset: 0,
            receiver_window: (256 * 1024) as i32,
            receiver_id: 99,
            group_tag: None,
            flags: 0,
        };
        let mut buf = [0u8; 64];
        let len = sm.encode(&mut buf);
        receiver.send_to(&buf[..len], publication.transport.local_addr());

        publication.do_work(Nanos(1));
        assert!(state.snd_lmt.get() > initial_limit);
        assert!(state.has_receivers.load(Ordering::Relaxed));
        assert_eq!(f.table.position(f.system.status_messages_received.id()).get(), 1);
    }

    #[test]
    fn nak_triggers_byte_identical_retransmit() {
        let f = fixture();
        let receiver = f.hub.bind("127.0.0.1:41003").unwrap();
        let state = pub_state(&f);
        let mut publication = sender_publication(&f, state.clone(), receiver.local_addr());

        let payload = [0xA5u8; 992];
        state.log.append_unfragmented(&payload, i64::MAX, true).unwrap();
        publication.do_work(Nanos(1));
        let original = drain(&receiver)
            .into_iter()
            .find(|(d, _)| protocol::classify(d) == Some(FrameType::Data))
            .unwrap()
            .0;

        let nak =
            NakMessage { session_id: 7, stream_id: 1001, term_id: 0, term_offset: 0, length: 1024 };
        let mut buf = [0u8; 64];
        let len = nak.encode(&mut buf);
        receiver.send_to(&buf[..len], publication.transport.local_addr());

        publication.do_work(Nanos(2));
        let retransmitted = drain(&receiver)
            .into_iter()
            .find(|(d, _)| protocol::classify(d) == Some(FrameType::Data))
            .unwrap()
            .0;
        assert_eq!(original, retransmitted);
        assert_eq!(f.table.position(f.system.retransmits_sent.id()).get(), 1);
        assert_eq!(f.table.position(f.system.naks_received.id()).get(), 1);
    }

    #[test]
    fn retransmit_overlap_suppressed() {
        let mut handler =
            RetransmitHandler::new(FeedbackDelay::immediate(), Nanos::from_millis(10), 4);
        assert!(handler.on_nak(2, 0, 1024, Nanos(1)));
        // overlapping range while pending: suppressed
        assert!(!handler.on_nak(2, 512, 1024, Nanos(2)));
        // disjoint range is accepted
        assert!(handler.on_nak(2, 4096, 512, Nanos(2)));

        let due = handler.take_due(Nanos(3));
        assert_eq!(due, vec![(2, 0, 1024), (2, 4096, 512)]);

        // lingering: still suppressed until the linger expires
        assert!(!handler.on_nak(2, 0, 1024, Nanos(4)));
        handler.take_due(Nanos(4) + Nanos::from_millis(11));
        assert!(handler.on_nak(2, 0, 1024, Nanos(5) + Nanos::from_millis(11)));
    }

    #[test]
    fn heartbeats_when_idle_and_connected() {
        let f = fixture();
        let receiver = f.hub.bind("127.0.0.1:41004").unwrap();
        let state = pub_state(&f);
        let mut publication = sender_publication(&f, state.clone(), receiver.local_addr());
        state.has_initial_connection.store(true, Ordering::Release);

        publication.do_work(Nanos(1));
        publication.do_work(Nanos(1) + HEARTBEAT_TIMEOUT + Nanos(1));

        let heartbeats: Vec<_> = drain(&receiver)
            .into_iter()
            .filter(|(d, _)| {
                protocol::classify(d) == Some(FrameType::Data) && d.len() == HEADER_LENGTH
            })
            .collect();
        assert!(!heartbeats.is_empty());
        assert!(f.table.position(f.system.heartbeats_sent.id()).get() >= 1);
    }

    #[test]
    fn spy_lag_throttles_publisher_limit() {
        let f = fixture();
        let state = pub_state(&f);
        let mut publication = NetworkPublication::new(
            1,
            "sluice:udp?endpoint=h:1".into(),
            false,
            state.clone(),
            TERM_LENGTH / 2,
            true,
            Nanos::from_secs(1),
            Nanos::from_secs(1),
            Nanos(0),
        );

        let spy_position = counter(&f);
        spy_position.set_ordered(0);
        publication.spy_subscribable.add_subscriber(
            5,
            spy_position,
            true,
            true,
            crate::subscribable::UntetheredTimeouts {
                window_limit: Nanos::from_secs(1),
                linger: Nanos::from_secs(1),
                resting: Nanos::from_secs(1),
            },
            Nanos(0),
        );

        state.snd_pos.set_ordered(10_000);
        publication.update_publisher_position_and_limit(Nanos(1));
        // limit follows the spy at 0, not the sender at 10k
        assert_eq!(state.pub_lmt.get(), (TERM_LENGTH / 2) as i64);
        // a spy simulating a connection flips the log's connected flag
        assert!(state.log.is_connected());
    }

    #[test]
    fn drain_waits_for_sender_and_receivers() {
        let f = fixture();
        let state = pub_state(&f);
        let mut publication = NetworkPublication::new(
            1,
            "sluice:udp?endpoint=h:1".into(),
            false,
            state.clone(),
            TERM_LENGTH / 2,
            false,
            Nanos::from_secs(1),
            Nanos::from_millis(10),
            Nanos(0),
        );

        state.log.append_unfragmented(&[1u8; 16], i64::MAX, true).unwrap();
        publication.dec_ref(Nanos(1));
        assert_eq!(publication.state(), PubLifecycle::Draining);
        assert_eq!(state.end_of_stream_position.load(Ordering::Relaxed), 48);

        let mut events = Vec::new();
        // sender has not caught up
        publication.on_time_event(Nanos(2), &mut events, &f.system);
        assert_eq!(publication.state(), PubLifecycle::Draining);

        // sender caught up, receiver acked past EOS
        state.snd_pos.set_ordered(48);
        state.has_receivers.store(true, Ordering::Release);
        state.sm_position.store(48, Ordering::Release);
        publication.on_time_event(Nanos(3), &mut events, &f.system);
        assert_eq!(publication.state(), PubLifecycle::Linger);

        publication.on_time_event(Nanos(3) + Nanos::from_millis(11), &mut events, &f.system);
        assert_eq!(publication.state(), PubLifecycle::Done);
        assert!(!publication.reached_end_of_life()); // sender still attached
        state.sender_released.store(true, Ordering::Release);
        assert!(publication.reached_end_of_life());
    }
}
