//! Already-decoded control-plane records. Commands ride the to-driver SPSC
//! ring; events ride the to-clients broadcast. Both are fixed-size `Copy`
//! types so they fit seqlock slots, with `ArrayStr` for the variable parts.

use sluice_utils::ArrayStr;

use crate::error::ErrorCode;

pub const CHANNEL_MAX: usize = 288;
pub const LABEL_MAX: usize = 160;
pub const KEY_MAX: usize = 64;
pub const REASON_MAX: usize = 160;

pub type ChannelStr = ArrayStr<CHANNEL_MAX>;
pub type LabelStr = ArrayStr<LABEL_MAX>;
pub type ReasonStr = ArrayStr<REASON_MAX>;

/// Fixed-capacity copy of a counter key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct CounterKey {
    pub len: u8,
    pub bytes: [u8; KEY_MAX],
}

impl Default for CounterKey {
    fn default() -> Self {
        Self { len: 0, bytes: [0u8; KEY_MAX] }
    }
}

impl CounterKey {
    pub fn from_bytes(src: &[u8]) -> Self {
        let mut bytes = [0u8; KEY_MAX];
        let len = src.len().min(KEY_MAX);
        bytes[..len].copy_from_slice(&src[..len]);
        Self { len: len as u8, bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub enum DriverCommand {
    /// Slot filler; never acted upon.
    #[default]
    Noop,
    AddPublication {
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: ChannelStr,
        is_exclusive: bool,
    },
    RemovePublication {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    },
    AddSubscription {
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: ChannelStr,
    },
    RemoveSubscription {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    },
    AddCounter {
        client_id: i64,
        correlation_id: i64,
        type_id: i32,
        key: CounterKey,
        label: LabelStr,
    },
    AddStaticCounter {
        client_id: i64,
        correlation_id: i64,
        type_id: i32,
        registration_id: i64,
        key: CounterKey,
        label: LabelStr,
    },
    RemoveCounter {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    },
    ClientKeepalive {
        client_id: i64,
    },
    ClientClose {
        client_id: i64,
    },
    RejectImage {
        client_id: i64,
        correlation_id: i64,
        image_correlation_id: i64,
        position: i64,
        reason: ReasonStr,
    },
    AddDestination {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
        destination: ChannelStr,
    },
    RemoveDestination {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
        destination: ChannelStr,
    },
    TerminateDriver {
        client_id: i64,
        correlation_id: i64,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub enum ClientEvent {
    /// Slot filler; never acted upon.
    #[default]
    Noop,
    PublicationReady {
        correlation_id: i64,
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        position_limit_counter_id: i32,
        log_file: ChannelStr,
        is_exclusive: bool,
    },
    SubscriptionReady {
        correlation_id: i64,
    },
    AvailableImage {
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        subscription_registration_id: i64,
        subscriber_position_id: i32,
        log_file: ChannelStr,
        source_identity: LabelStr,
    },
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
    },
    OperationSuccess {
        correlation_id: i64,
    },
    Error {
        correlation_id: i64,
        code: ErrorCode,
        message: LabelStr,
    },
    CounterReady {
        correlation_id: i64,
        counter_id: i32,
    },
    UnavailableCounter {
        registration_id: i64,
        counter_id: i32,
    },
    ClientTimeout {
        client_id: i64,
    },
    PublicationError {
        registration_id: i64,
        session_id: i32,
        code: ErrorCode,
        message: LabelStr,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_key_truncates() {
        let key = CounterKey::from_bytes(&[1u8; 100]);
        assert_eq!(key.len as usize, KEY_MAX);
        assert_eq!(key.as_slice().len(), KEY_MAX);
    }

    #[test]
    fn records_stay_seqlock_sized() {
        // one slot per cache-line multiple; keep control records bounded
        assert!(std::mem::size_of::<DriverCommand>() <= 384);
        assert!(std::mem::size_of::<ClientEvent>() <= 512);
    }
}
