//! Receive-side reassembly of one sender's stream on one channel.
//!
//! The receiver thread inserts packets and advances the high-water mark;
//! the conductor tracks the rebuild position, emits status messages and
//! NAKs, reports loss and runs the lifecycle. Shared state is the same
//! single-writer release/acquire split as on the publication side.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering},
    },
};

use sluice_logbuffer::{
    LogBuffers, LossEntry, LossReport, Position, descriptor,
    frame::{self, FrameFlags, HEADER_LENGTH},
};
use sluice_timing::Nanos;
use tracing::debug;

use crate::{
    command::ClientEvent,
    counters::SystemCounters,
    feedback::FeedbackDelay,
    protocol::{NakMessage, StatusMessage},
    subscribable::Subscribable,
    transport::ChannelTransport,
};

/// Fields shared between the receiver and the conductor.
pub struct ImageState {
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub position_bits_to_shift: u32,
    pub log: Arc<LogBuffers>,

    pub hwm: Position,
    pub rcv_pos: Position,
    pub time_of_last_packet: AtomicU64,
    pub heartbeats_received: AtomicU64,
    pub is_end_of_stream: AtomicBool,
    pub end_of_stream_position: AtomicI64,

    // loss snapshot guarded by a begin/end change pair: concurrent readers
    // retry until both counters match
    begin_loss_change: AtomicI64,
    end_loss_change: AtomicI64,
    loss_term_id: AtomicI32,
    loss_term_offset: AtomicI32,
    loss_length: AtomicI32,
}

impl ImageState {
    pub fn new(log: Arc<LogBuffers>, hwm: Position, rcv_pos: Position, join_position: i64) -> Arc<Self> {
        hwm.set_ordered(join_position);
        rcv_pos.set_ordered(join_position);
        Arc::new(Self {
            session_id: log.session_id(),
            stream_id: log.stream_id(),
            initial_term_id: log.initial_term_id(),
            term_length: log.term_length(),
            position_bits_to_shift: log.position_bits_to_shift(),
            log,
            hwm,
            rcv_pos,
            time_of_last_packet: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            is_end_of_stream: AtomicBool::new(false),
            end_of_stream_position: AtomicI64::new(i64::MAX),
            begin_loss_change: AtomicI64::new(-1),
            end_loss_change: AtomicI64::new(-1),
            loss_term_id: AtomicI32::new(0),
            loss_term_offset: AtomicI32::new(0),
            loss_length: AtomicI32::new(0),
        })
    }

    pub fn record_loss(&self, term_id: i32, term_offset: i32, length: i32) {
        let change = self.begin_loss_change.load(Ordering::Relaxed) + 1;
        self.begin_loss_change.store(change, Ordering::Release);
        self.loss_term_id.store(term_id, Ordering::Relaxed);
        self.loss_term_offset.store(term_offset, Ordering::Relaxed);
        self.loss_length.store(length, Ordering::Relaxed);
        self.end_loss_change.store(change, Ordering::Release);
    }

    /// A consistent `(termId, termOffset, length)` snapshot, or None while
    /// a change is in flight or nothing was recorded yet.
    pub fn read_loss(&self) -> Option<(i32, i32, i32)> {
        for _ in 0..3 {
            let end = self.end_loss_change.load(Ordering::Acquire);
            if end < 0 {
                return None;
            }
            let snapshot = (
                self.loss_term_id.load(Ordering::Relaxed),
                self.loss_term_offset.load(Ordering::Relaxed),
                self.loss_length.load(Ordering::Relaxed),
            );
            if self.begin_loss_change.load(Ordering::Acquire) == end {
                return Some(snapshot);
            }
        }
        None
    }
}

/// Receiver-thread handle: packet insertion only.
pub struct ImageConnection {
    pub correlation_id: i64,
    state: Arc<ImageState>,
    window_length: usize,
    counters: SystemCounters,
}

impl ImageConnection {
    pub fn new(correlation_id: i64, state: Arc<ImageState>, window_length: usize, counters: SystemCounters) -> Self {
        Self { correlation_id, state, window_length, counters }
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        self.state.session_id
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.state.stream_id
    }

    /// Insert one datagram of frames at `(termId, termOffset)`. Writing the
    /// same frame twice is allowed; packets outside the window around the
    /// high-water mark are dropped. Returns whether the packet was taken.
    pub fn insert_packet(&self, term_id: i32, term_offset: i32, packet: &[u8], now: Nanos) -> bool {
        let state = &*self.state;
        let bits = state.position_bits_to_shift;
        let packet_position =
            descriptor::compute_position(term_id, term_offset, bits, state.initial_term_id);
        let hwm = state.hwm.get_volatile();
        let window = self.window_length as i64;
        if packet_position < hwm - window || packet_position > hwm + window {
            return false;
        }

        state.time_of_last_packet.store(now.0, Ordering::Release);

        let advance = if is_heartbeat(packet) {
            state.heartbeats_received.fetch_add(1, Ordering::Relaxed);
            self.counters.heartbeats_received.increment();
            if FrameFlags::from_bits_retain(packet[frame::FLAGS_OFFSET])
                .contains(FrameFlags::EOS)
            {
                state.end_of_stream_position.store(packet_position, Ordering::Release);
                state.is_end_of_stream.store(true, Ordering::Release);
            }
            0
        } else {
            self.copy_frames(term_id, term_offset, packet)
        };

        self.counters.bytes_received.add(packet.len() as i64);
        state.hwm.propose_max_ordered(packet_position + advance as i64);
        true
    }

    /// Copy each frame into the term, its length word last so readers see
    /// whole frames. Returns the stream bytes the packet covers.
    fn copy_frames(&self, term_id: i32, term_offset: i32, packet: &[u8]) -> usize {
        let state = &*self.state;
        let index = descriptor::index_by_term(state.initial_term_id, term_id);
        let term = state.log.term_buffer(index);

        let mut packet_offset = 0usize;
        let mut advance = 0usize;
        while packet_offset + HEADER_LENGTH <= packet.len() {
            let declared = i32::from_le_bytes(
                packet[packet_offset..packet_offset + 4].try_into().unwrap(),
            );
            if declared <= 0 {
                break;
            }
            let aligned = frame::aligned_length(declared as usize);
            let copy_len = (declared as usize).min(packet.len() - packet_offset);
            let dst = term_offset as usize + packet_offset;
            if dst + aligned > state.term_length {
                break;
            }

            term.put_bytes(dst + 4, &packet[packet_offset + 4..packet_offset + copy_len]);
            term.put_i32_ordered(dst, declared);

            advance += aligned;
            packet_offset += aligned;
        }
        advance
    }
}

#[inline]
fn is_heartbeat(packet: &[u8]) -> bool {
    packet.len() == HEADER_LENGTH
        && i32::from_le_bytes(packet[0..4].try_into().unwrap()) == HEADER_LENGTH as i32
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Gap {
    term_id: i32,
    term_offset: i32,
    length: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageLifecycle {
    Active,
    /// Rejected: refuses subscribers until the deadline, then is removed.
    Cooldown,
    Done,
}

/// Conductor-side image: lifecycle, rebuild tracking, status messages,
/// NAK scheduling and loss accounting.
pub struct PublicationImage {
    pub correlation_id: i64,
    pub channel: String,
    pub source_identity: String,
    pub shared: Arc<ImageState>,
    pub subscribable: Subscribable,
    pub is_reliable: bool,

    transport: Arc<dyn ChannelTransport>,
    control_addr: SocketAddr,
    receiver_id: i64,
    counters: SystemCounters,

    window_length: usize,
    status_message_timeout: Nanos,
    sm_deadline: Nanos,
    last_sm_position: i64,
    force_sm: bool,

    nak_delay_generator: FeedbackDelay,
    active_gap: Option<Gap>,
    nak_deadline: Nanos,
    nak_retry: u32,
    rcv_naks_sent: u64,

    reported_loss: Option<Gap>,
    loss_entry: Option<LossEntry>,

    liveness_timeout: Nanos,
    lifecycle: ImageLifecycle,
    cooldown_deadline: Nanos,
    clean_position: i64,
}

#[allow(clippy::too_many_arguments)]
impl PublicationImage {
    pub fn new(
        correlation_id: i64,
        channel: String,
        source_identity: String,
        shared: Arc<ImageState>,
        transport: Arc<dyn ChannelTransport>,
        control_addr: SocketAddr,
        receiver_id: i64,
        window_length: usize,
        status_message_timeout: Nanos,
        nak_delay_generator: FeedbackDelay,
        liveness_timeout: Nanos,
        is_reliable: bool,
        counters: SystemCounters,
        now: Nanos,
    ) -> Self {
        let join_position = shared.rcv_pos.get();
        shared.time_of_last_packet.store(now.0, Ordering::Release);
        Self {
            correlation_id,
            channel,
            source_identity,
            shared,
            subscribable: Subscribable::default(),
            is_reliable,
            transport,
            control_addr,
            receiver_id,
            counters,
            window_length,
            status_message_timeout,
            sm_deadline: Nanos::ZERO,
            last_sm_position: join_position,
            force_sm: true,
            nak_delay_generator,
            active_gap: None,
            nak_deadline: Nanos::MAX,
            nak_retry: 0,
            rcv_naks_sent: 0,
            reported_loss: None,
            loss_entry: None,
            liveness_timeout,
            lifecycle: ImageLifecycle::Active,
            cooldown_deadline: Nanos::MAX,
            clean_position: join_position,
        }
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
    pub fn lifecycle(&self) -> ImageLifecycle {
        self.lifecycle
    }

    #[inline]
    pub fn rcv_naks_sent(&self) -> u64 {
        self.rcv_naks_sent
    }

    #[inline]
    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn accepting_subscribers(&self) -> bool {
        self.lifecycle == ImageLifecycle::Active
    }

    pub fn join_position(&self) -> i64 {
        self.shared.rcv_pos.get()
    }

    pub fn rejoin_position(&self) -> i64 {
        self.subscribable.min_position().unwrap_or_else(|| self.shared.rcv_pos.get())
    }

    pub fn on_time_event(&mut self, now: Nanos, events: &mut Vec<ClientEvent>) {
        match self.lifecycle {
            ImageLifecycle::Active => {
                let last_packet = Nanos(self.shared.time_of_last_packet.load(Ordering::Acquire));
                if now.saturating_sub(last_packet) >= self.liveness_timeout {
                    debug!(
                        correlation_id = self.correlation_id,
                        session_id = self.shared.session_id,
                        "image liveness expired"
                    );
                    self.disconnect_subscribers(events);
                    self.lifecycle = ImageLifecycle::Done;
                }
            }
            ImageLifecycle::Cooldown => {
                if now >= self.cooldown_deadline {
                    self.lifecycle = ImageLifecycle::Done;
                }
            }
            ImageLifecycle::Done => {}
        }
    }

    fn disconnect_subscribers(&mut self, events: &mut Vec<ClientEvent>) {
        for subscriber in self.subscribable.positions() {
            events.push(ClientEvent::UnavailableImage {
                correlation_id: self.correlation_id,
                subscription_registration_id: subscriber.link_registration_id,
                stream_id: self.shared.stream_id,
            });
        }
    }

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

    /// Explicit client rejection: tear down delivery and refuse new
    /// subscribers until the liveness timeout passes.
    pub fn reject(&mut self, reason: &str, now: Nanos, events: &mut Vec<ClientEvent>) -> Vec<Position> {
        debug!(correlation_id = self.correlation_id, reason, "image rejected");
        self.disconnect_subscribers(events);
        let freed = self.drain_subscriber_positions();
        self.counters.images_rejected.increment();
        self.lifecycle = ImageLifecycle::Cooldown;
        self.cooldown_deadline = now + self.liveness_timeout;
        freed
    }

    /// Advance the rebuild position over contiguous committed frames, then
    /// run gap detection and NAK scheduling on what remains below the HWM.
    pub fn track_rebuild(&mut self, now: Nanos, loss_report: &mut LossReport) -> usize {
        if self.lifecycle != ImageLifecycle::Active {
            return 0;
        }
        let state = &*self.shared;
        let bits = state.position_bits_to_shift;
        let hwm = state.hwm.get_volatile();
        let mut rebuild = state.rcv_pos.get();
        let mut work = 0;

        while rebuild < hwm {
            let index = descriptor::index_by_position(rebuild, bits);
            let offset = descriptor::compute_term_offset_from_position(rebuild, bits) as usize;
            if offset >= state.term_length {
                break;
            }
            let term = state.log.term_buffer(index);
            let frame_length = frame::frame_length_volatile(&term, offset);
            if frame_length <= 0 {
                break;
            }
            rebuild += frame::aligned_length(frame_length as usize) as i64;
            work += 1;
        }
        if rebuild > state.rcv_pos.get() {
            state.rcv_pos.set_ordered(rebuild);
        }

        if rebuild < hwm {
            let gap = self.scan_gap(rebuild, hwm);
            self.on_gap(gap, now, loss_report);
        } else {
            self.active_gap = None;
            self.nak_retry = 0;
            self.nak_deadline = Nanos::MAX;
        }

        // bytes every subscriber consumed can be zeroed for term reuse
        let state = &*self.shared;
        let min_consumed = self.subscribable.min_position().unwrap_or(rebuild).min(rebuild);
        if min_consumed > self.clean_position {
            state.log.clean_between(self.clean_position, min_consumed);
            self.clean_position = min_consumed;
        }
        work
    }

    fn scan_gap(&self, from: i64, hwm: i64) -> Gap {
        let state = &*self.shared;
        let bits = state.position_bits_to_shift;
        let term_id =
            descriptor::compute_term_id_from_position(from, bits, state.initial_term_id);
        let start = descriptor::compute_term_offset_from_position(from, bits) as usize;
        let index = descriptor::index_by_position(from, bits);
        let term = state.log.term_buffer(index);

        let term_limit = (hwm - descriptor::compute_term_begin_position(term_id, bits, state.initial_term_id))
            .min(state.term_length as i64) as usize;
        let mut end = start + frame::FRAME_ALIGNMENT;
        while end < term_limit && frame::frame_length_volatile(&term, end) == 0 {
            end += frame::FRAME_ALIGNMENT;
        }
        Gap { term_id, term_offset: start as i32, length: (end - start) as i32 }
    }

    fn on_gap(&mut self, gap: Gap, now: Nanos, loss_report: &mut LossReport) {
        if self.active_gap == Some(gap) {
            if self.is_reliable && now >= self.nak_deadline {
                self.send_nak(gap);
                self.nak_retry += 1;
                self.nak_deadline = now + self.nak_delay_generator.delay(self.nak_retry);
            }
            return;
        }

        self.record_loss(gap, now, loss_report);
        self.active_gap = Some(gap);
        self.nak_retry = 0;
        self.nak_deadline = now + self.nak_delay_generator.delay(0);
    }

    /// Dedupe loss: a repeat of the tracked gap is not new loss; a longer
    /// or higher-overlapping gap contributes only the difference; another
    /// term starts fresh.
    fn record_loss(&mut self, gap: Gap, now: Nanos, loss_report: &mut LossReport) {
        let new_bytes = match self.reported_loss {
            None => i64::from(gap.length),
            Some(reported) if reported.term_id != gap.term_id => i64::from(gap.length),
            Some(reported) => {
                let reported_end = reported.term_offset + reported.length;
                let gap_end = gap.term_offset + gap.length;
                if gap.term_offset >= reported.term_offset && gap_end <= reported_end {
                    0
                } else if gap.term_offset >= reported_end {
                    i64::from(gap.length)
                } else {
                    i64::from(gap_end - reported_end.max(gap.term_offset))
                }
            }
        };
        if new_bytes <= 0 {
            return;
        }

        self.shared.record_loss(gap.term_id, gap.term_offset, gap.length);
        self.reported_loss = Some(gap);
        match self.loss_entry {
            Some(entry) => loss_report.record_observation(entry, new_bytes, now),
            None => {
                self.loss_entry = loss_report.create_entry(
                    new_bytes,
                    now,
                    self.shared.session_id,
                    self.shared.stream_id,
                    &self.channel,
                    &self.source_identity,
                );
            }
        }
    }

    fn send_nak(&mut self, gap: Gap) {
        let nak = NakMessage {
            session_id: self.shared.session_id,
            stream_id: self.shared.stream_id,
            term_id: gap.term_id,
            term_offset: gap.term_offset,
            length: gap.length,
        };
        let mut buf = [0u8; crate::protocol::NAK_LENGTH];
        let len = nak.encode(&mut buf);
        self.transport.send_to(&buf[..len], self.control_addr);
        self.rcv_naks_sent += 1;
        self.counters.naks_sent.increment();
    }

    /// Emit a status message when the deadline passes, consumption moved a
    /// quarter window, or something forced one (join, SETUP elicitation).
    pub fn send_pending_status_message(&mut self, now: Nanos) -> usize {
        if self.lifecycle != ImageLifecycle::Active {
            return 0;
        }
        let consumption = self
            .subscribable
            .min_position()
            .unwrap_or_else(|| self.shared.rcv_pos.get());
        let threshold = self.last_sm_position + (self.window_length / 4) as i64;
        if !self.force_sm && now < self.sm_deadline && consumption < threshold {
            return 0;
        }

        let bits = self.shared.position_bits_to_shift;
        let sm = StatusMessage {
            session_id: self.shared.session_id,
            stream_id: self.shared.stream_id,
            consumption_term_id: descriptor::compute_term_id_from_position(
                consumption,
                bits,
                self.shared.initial_term_id,
            ),
            consumption_term_offset: descriptor::compute_term_offset_from_position(consumption, bits),
            receiver_window: self.window_length as i32,
            receiver_id: self.receiver_id,
            group_tag: None,
            flags: 0,
        };
        let mut buf = [0u8; crate::protocol::STATUS_MESSAGE_WITH_GTAG_LENGTH];
        let len = sm.encode(&mut buf);
        self.transport.send_to(&buf[..len], self.control_addr);
        self.counters.status_messages_sent.increment();
        self.sm_deadline = now + self.status_message_timeout;
        self.last_sm_position = consumption;
        self.force_sm = false;
        1
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
        protocol,
        transport::{ChannelTransport, LoopbackHub},
    };

    const TERM_LENGTH: usize = 64 * 1024;
    const WINDOW: usize = 128 * 1024;

    struct Fixture {
        _region: MappedRegion,
        table: CounterTable,
        system: SystemCounters,
        hub: LoopbackHub,
        loss_report_region: MappedRegion,
    }

    fn fixture() -> Fixture {
        let region = MappedRegion::heap(64 * (METADATA_RECORD_LENGTH + VALUE_RECORD_LENGTH));
        let table = CounterTable::new(
            region.buffer(0, 64 * METADATA_RECORD_LENGTH),
            region.buffer(64 * METADATA_RECORD_LENGTH, 64 * VALUE_RECORD_LENGTH),
            Nanos::ZERO,
        );
        let system = SystemCounters::allocate(&table, Nanos(1)).unwrap();
        Fixture {
            _region: region,
            table,
            system,
            hub: LoopbackHub::default(),
            loss_report_region: MappedRegion::heap(4096),
        }
    }

    fn counter(f: &Fixture) -> Position {
        let id = f.table.allocate(3, b"", "c", NULL_REGISTRATION_ID, 1, Nanos(1)).unwrap();
        f.table.position(id)
    }

    fn image_state(f: &Fixture) -> Arc<ImageState> {
        let log = Arc::new(LogBuffers::create_unshared(TERM_LENGTH).unwrap());
        log.initialize(0, 0, 0, 1408, 4096, 7, 1001, 1);
        ImageState::new(log, counter(f), counter(f), 0)
    }

    fn connection(f: &Fixture, state: Arc<ImageState>) -> ImageConnection {
        ImageConnection::new(100, state, WINDOW, f.system)
    }

    fn conductor_image(
        f: &Fixture,
        state: Arc<ImageState>,
        sender: SocketAddr,
        nak_delay: Nanos,
    ) -> PublicationImage {
        PublicationImage::new(
            100,
            "sluice:udp?endpoint=127.0.0.1:41100".into(),
            "127.0.0.1:54321".into(),
            state,
            f.hub.bind_ephemeral(),
            sender,
            77,
            WINDOW,
            Nanos::from_millis(200),
            FeedbackDelay::Static { delay: nak_delay },
            Nanos::from_millis(100),
            true,
            f.system,
            Nanos(0),
        )
    }

    fn loss_report(f: &Fixture) -> LossReport {
        LossReport::new(f.loss_report_region.buffer(0, 4096))
    }

    /// A single committed data frame as it would appear on the wire.
    fn data_packet(term_id: i32, term_offset: i32, payload: &[u8]) -> Vec<u8> {
        let frame_length = HEADER_LENGTH + payload.len();
        let mut packet = vec![0u8; frame::aligned_length(frame_length)];
        packet[0..4].copy_from_slice(&(frame_length as i32).to_le_bytes());
        packet[frame::VERSION_OFFSET] = frame::CURRENT_VERSION;
        packet[frame::FLAGS_OFFSET] = FrameFlags::UNFRAGMENTED.bits();
        packet[frame::TYPE_OFFSET..frame::TYPE_OFFSET + 2]
            .copy_from_slice(&(frame::FrameType::Data as u16).to_le_bytes());
        packet[frame::TERM_OFFSET_OFFSET..frame::TERM_OFFSET_OFFSET + 4]
            .copy_from_slice(&term_offset.to_le_bytes());
        packet[frame::SESSION_ID_OFFSET..frame::SESSION_ID_OFFSET + 4]
            .copy_from_slice(&7i32.to_le_bytes());
        packet[frame::STREAM_ID_OFFSET..frame::STREAM_ID_OFFSET + 4]
            .copy_from_slice(&1001i32.to_le_bytes());
        packet[frame::TERM_ID_OFFSET..frame::TERM_ID_OFFSET + 4]
            .copy_from_slice(&term_id.to_le_bytes());
        packet[HEADER_LENGTH..HEADER_LENGTH + payload.len()].copy_from_slice(payload);
        packet
    }

    fn heartbeat_packet(term_id: i32, term_offset: i32, eos: bool) -> Vec<u8> {
        let mut packet = data_packet(term_id, term_offset, &[]);
        packet.truncate(HEADER_LENGTH);
        packet[0..4].copy_from_slice(&(HEADER_LENGTH as i32).to_le_bytes());
        if eos {
            packet[frame::FLAGS_OFFSET] |= FrameFlags::EOS.bits();
        }
        packet
    }

    #[test]
    fn data_advances_hwm_and_heartbeats_count() {
        let f = fixture();
        let state = image_state(&f);
        // join the stream mid-term-1 so positions are term-relative
        let term_base = TERM_LENGTH as i64;
        state.hwm.set_ordered(term_base + 1024);
        state.rcv_pos.set_ordered(term_base + 1024);
        let conn = connection(&f, state.clone());

        let packet = data_packet(1, 1024, &[0x11u8; 512 - HEADER_LENGTH]);
        assert!(conn.insert_packet(1, 1024, &packet, Nanos(5)));
        assert_eq!(state.hwm.get_volatile(), term_base + 1024 + 512);

        // a zero-length heartbeat further on advances the HWM to its offset
        assert!(conn.insert_packet(1, 2048, &heartbeat_packet(1, 2048, false), Nanos(6)));
        assert_eq!(state.hwm.get_volatile(), term_base + 2048);
        assert_eq!(state.heartbeats_received.load(Ordering::Relaxed), 1);
        assert_eq!(state.time_of_last_packet.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn insert_is_idempotent() {
        let f = fixture();
        let state = image_state(&f);
        let conn = connection(&f, state.clone());

        let packet = data_packet(0, 0, b"same frame");
        assert!(conn.insert_packet(0, 0, &packet, Nanos(1)));
        assert!(conn.insert_packet(0, 0, &packet, Nanos(2)));
        assert_eq!(state.hwm.get_volatile(), 64);

        let term = state.log.term_buffer(0);
        assert_eq!(frame::frame_length_volatile(&term, 0) as usize, HEADER_LENGTH + 10);
        assert_eq!(term.slice(HEADER_LENGTH, 10), b"same frame");
    }

    #[test]
    fn packets_outside_window_rejected() {
        let f = fixture();
        let state = image_state(&f);
        let conn = connection(&f, state.clone());

        // far ahead of the hwm window
        let far_term = (3 * WINDOW / TERM_LENGTH) as i32;
        let packet = data_packet(far_term, 0, b"x");
        assert!(!conn.insert_packet(far_term, 0, &packet, Nanos(1)));
        assert_eq!(state.hwm.get_volatile(), 0);
    }

    #[test]
    fn eos_heartbeat_marks_end_of_stream() {
        let f = fixture();
        let state = image_state(&f);
        let conn = connection(&f, state.clone());

        let packet = data_packet(0, 0, b"last");
        conn.insert_packet(0, 0, &packet, Nanos(1));
        conn.insert_packet(0, 64, &heartbeat_packet(0, 64, true), Nanos(2));

        assert!(state.is_end_of_stream.load(Ordering::Relaxed));
        assert_eq!(state.end_of_stream_position.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn rebuild_advances_over_contiguous_frames() {
        let f = fixture();
        let state = image_state(&f);
        let conn = connection(&f, state.clone());
        let sender = f.hub.bind("127.0.0.1:41200").unwrap();
        let mut image = conductor_image(&f, state.clone(), sender.local_addr(), Nanos::from_micros(100));
        let mut report = loss_report(&f);

        conn.insert_packet(0, 0, &data_packet(0, 0, &[1u8; 32]), Nanos(1));
        conn.insert_packet(0, 64, &data_packet(0, 64, &[2u8; 32]), Nanos(1));
        image.track_rebuild(Nanos(2), &mut report);
        assert_eq!(state.rcv_pos.get_volatile(), 128);
        assert!(image.active_gap.is_none());
    }

    #[test]
    fn gap_naks_after_delay_once() {
        let f = fixture();
        let state = image_state(&f);
        let conn = connection(&f, state.clone());
        let sender = f.hub.bind("127.0.0.1:41201").unwrap();
        let mut image = conductor_image(&f, state.clone(), sender.local_addr(), Nanos::from_micros(100));
        let mut report = loss_report(&f);

        // frame at (2,0..1024) missing; a later frame arrived at 1024
        let term2_base = 2 * TERM_LENGTH as i64;
        state.hwm.set_ordered(term2_base);
        state.rcv_pos.set_ordered(term2_base);
        conn.insert_packet(2, 1024, &data_packet(2, 1024, &[3u8; 64]), Nanos(1));

        // detection schedules the NAK after nak-delay; nothing sent yet
        image.track_rebuild(Nanos(10), &mut report);
        assert_eq!(image.rcv_naks_sent(), 0);

        // deadline passes: exactly one NAK for (2, 0, 1024)
        image.track_rebuild(Nanos(10) + Nanos::from_micros(101), &mut report);
        assert_eq!(image.rcv_naks_sent(), 1);

        let naks: Vec<_> = {
            let mut frames = Vec::new();
            sender.poll(16, &mut |d, _| frames.push(d.to_vec()));
            frames
                .into_iter()
                .filter(|d| protocol::classify(d) == Some(frame::FrameType::Nak))
                .collect()
        };
        assert_eq!(naks.len(), 1);
        let nak = protocol::NakMessage::decode(&naks[0]).unwrap();
        assert_eq!((nak.term_id, nak.term_offset, nak.length), (2, 0, 1024));
    }

    #[test]
    fn loss_reporting_is_idempotent_and_extends() {
        let f = fixture();
        let state = image_state(&f);
        let sender = f.hub.bind("127.0.0.1:41202").unwrap();
        let mut image = conductor_image(&f, state.clone(), sender.local_addr(), Nanos::from_micros(100));
        let mut report = loss_report(&f);

        let gap = Gap { term_id: 2, term_offset: 0, length: 1024 };
        image.record_loss(gap, Nanos(1), &mut report);
        // same triple again: no new observation
        image.record_loss(gap, Nanos(2), &mut report);

        let mut observations = Vec::new();
        report.for_each(|o| observations.push((o.observation_count, o.total_bytes_lost)));
        assert_eq!(observations, vec![(1, 1024)]);

        // extended gap: exactly one more observation with the difference
        image.record_loss(Gap { term_id: 2, term_offset: 0, length: 1536 }, Nanos(3), &mut report);
        observations.clear();
        report.for_each(|o| observations.push((o.observation_count, o.total_bytes_lost)));
        assert_eq!(observations, vec![(2, 1536)]);

        assert_eq!(state.read_loss(), Some((2, 0, 1536)));
    }

    #[test]
    fn status_messages_on_deadline_and_progress() {
        let f = fixture();
        let state = image_state(&f);
        let sender = f.hub.bind("127.0.0.1:41203").unwrap();
        let mut image = conductor_image(&f, state.clone(), sender.local_addr(), Nanos::from_micros(100));

        // join forces the first SM
        assert_eq!(image.send_pending_status_message(Nanos(1)), 1);
        assert_eq!(image.send_pending_status_message(Nanos(2)), 0);

        // deadline forces the next
        assert_eq!(image.send_pending_status_message(Nanos(2) + Nanos::from_millis(201)), 1);

        // a quarter-window of consumption forces one early
        state.rcv_pos.set_ordered((WINDOW / 4) as i64 + 64);
        assert_eq!(image.send_pending_status_message(Nanos(3) + Nanos::from_millis(201)), 1);

        let mut sms = 0;
        sender.poll(16, &mut |d, _| {
            if protocol::classify(d) == Some(frame::FrameType::StatusMessage) {
                let sm = protocol::StatusMessage::decode(d).unwrap();
                assert_eq!(sm.receiver_id, 77);
                assert_eq!(sm.receiver_window as usize, WINDOW);
                sms += 1;
            }
        });
        assert_eq!(sms, 3);
    }

    #[test]
    fn liveness_timeout_ends_image() {
        let f = fixture();
        let state = image_state(&f);
        let sender = f.hub.bind("127.0.0.1:41204").unwrap();
        let mut image = conductor_image(&f, state.clone(), sender.local_addr(), Nanos::from_micros(100));
        image.subscribable.add_subscriber(
            9,
            counter(&f),
            true,
            true,
            crate::subscribable::UntetheredTimeouts {
                window_limit: Nanos::from_secs(1),
                linger: Nanos::from_secs(1),
                resting: Nanos::from_secs(1),
            },
            Nanos(0),
        );

        let mut events = Vec::new();
        image.on_time_event(Nanos::from_millis(50), &mut events);
        assert_eq!(image.lifecycle(), ImageLifecycle::Active);

        image.on_time_event(Nanos::from_millis(101), &mut events);
        assert_eq!(image.lifecycle(), ImageLifecycle::Done);
        assert!(matches!(
            events[..],
            [ClientEvent::UnavailableImage { subscription_registration_id: 9, .. }]
        ));
    }

    #[test]
    fn reject_enters_cooldown_then_done() {
        let f = fixture();
        let state = image_state(&f);
        let sender = f.hub.bind("127.0.0.1:41205").unwrap();
        let mut image = conductor_image(&f, state.clone(), sender.local_addr(), Nanos::from_micros(100));

        let mut events = Vec::new();
        image.reject("bad payload", Nanos(10), &mut events);
        assert_eq!(image.lifecycle(), ImageLifecycle::Cooldown);
        assert!(!image.accepting_subscribers());

        image.on_time_event(Nanos(10) + Nanos::from_millis(99), &mut events);
        assert_eq!(image.lifecycle(), ImageLifecycle::Cooldown);
        image.on_time_event(Nanos(10) + Nanos::from_millis(101), &mut events);
        assert_eq!(image.lifecycle(), ImageLifecycle::Done);
        assert_eq!(f.table.position(f.system.images_rejected.id()).get(), 1);
    }
}
