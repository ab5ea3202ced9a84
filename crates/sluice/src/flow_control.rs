//! Sender-side flow control: a pluggable policy turning received status
//! messages into a send limit. Resolved per channel from the URI `fc`
//! param. Receivers silent past the timeout fall out of the aggregate.
//!
//! Spies never enter these aggregates even when they simulate a
//! connection; only network receivers carry flow-control weight.

use std::net::SocketAddr;

use sluice_logbuffer::descriptor;
use sluice_timing::Nanos;

use crate::{
    channel::{FcOptions, FcStrategy},
    protocol::StatusMessage,
};

#[derive(Clone, Copy, Debug)]
struct Receiver {
    receiver_id: i64,
    addr: SocketAddr,
    last_position: i64,
    last_position_plus_window: i64,
    time_of_last_sm: Nanos,
}

#[derive(Clone, Debug)]
pub enum FlowControl {
    /// Limit follows the fastest receiver.
    Max(ReceiverSet),
    /// Limit follows the slowest live receiver.
    Min(ReceiverSet),
    /// Limit follows the slowest receiver carrying the matching group tag.
    Tagged(ReceiverSet, i64),
}

impl FlowControl {
    pub fn from_options(options: &FcOptions, default_timeout: Nanos) -> Self {
        let timeout = options.receiver_timeout.unwrap_or(default_timeout);
        let set = ReceiverSet { receivers: Vec::new(), timeout };
        match options.strategy {
            FcStrategy::Max => Self::Max(set),
            FcStrategy::Min => Self::Min(set),
            FcStrategy::Tagged => Self::Tagged(set, options.group_tag.unwrap_or(0)),
        }
    }

    /// Fold one status message into the aggregate and return the new
    /// sender limit.
    pub fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        src: SocketAddr,
        initial_term_id: i32,
        position_bits_to_shift: u32,
        sender_limit: i64,
        now: Nanos,
    ) -> i64 {
        let position = descriptor::compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            position_bits_to_shift,
            initial_term_id,
        );
        let window_edge = position + i64::from(sm.receiver_window);

        match self {
            Self::Max(set) => {
                set.update(sm, src, position, window_edge, now);
                set.max_window_edge().unwrap_or(sender_limit).max(sender_limit)
            }
            Self::Min(set) => {
                set.update(sm, src, position, window_edge, now);
                set.min_window_edge().unwrap_or(sender_limit)
            }
            Self::Tagged(set, tag) => {
                if sm.group_tag == Some(*tag) {
                    set.update(sm, src, position, window_edge, now);
                }
                set.min_window_edge().unwrap_or(sender_limit)
            }
        }
    }

    /// Periodic sweep: drop silent receivers and recompute the limit.
    pub fn on_idle(&mut self, now: Nanos, sender_limit: i64) -> i64 {
        match self {
            Self::Max(set) => {
                set.evict(now);
                set.max_window_edge().unwrap_or(sender_limit)
            }
            Self::Min(set) | Self::Tagged(set, _) => {
                set.evict(now);
                set.min_window_edge().unwrap_or(sender_limit)
            }
        }
    }

    pub fn has_receivers(&self) -> bool {
        match self {
            Self::Max(set) | Self::Min(set) | Self::Tagged(set, _) => !set.receivers.is_empty(),
        }
    }

    /// Lowest consumption position across live receivers, for end-of-stream
    /// draining.
    pub fn min_receiver_position(&self) -> Option<i64> {
        match self {
            Self::Max(set) | Self::Min(set) | Self::Tagged(set, _) => {
                set.receivers.iter().map(|r| r.last_position).min()
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReceiverSet {
    receivers: Vec<Receiver>,
    timeout: Nanos,
}

impl ReceiverSet {
    fn update(
        &mut self,
        sm: &StatusMessage,
        addr: SocketAddr,
        position: i64,
        window_edge: i64,
        now: Nanos,
    ) {
        if let Some(receiver) = self
            .receivers
            .iter_mut()
            .find(|r| r.receiver_id == sm.receiver_id && r.addr == addr)
        {
            receiver.last_position = position.max(receiver.last_position);
            receiver.last_position_plus_window = window_edge;
            receiver.time_of_last_sm = now;
        } else {
            self.receivers.push(Receiver {
                receiver_id: sm.receiver_id,
                addr,
                last_position: position,
                last_position_plus_window: window_edge,
                time_of_last_sm: now,
            });
        }
    }

    fn evict(&mut self, now: Nanos) {
        let timeout = self.timeout;
        self.receivers.retain(|r| now.saturating_sub(r.time_of_last_sm) < timeout);
    }

    fn min_window_edge(&self) -> Option<i64> {
        self.receivers.iter().map(|r| r.last_position_plus_window).min()
    }

    fn max_window_edge(&self) -> Option<i64> {
        self.receivers.iter().map(|r| r.last_position_plus_window).max()
    }
}
