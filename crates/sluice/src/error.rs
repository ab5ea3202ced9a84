use sluice_logbuffer::{CountersError, LogBufferError, RingError};
use thiserror::Error;

/// Wire-level error codes surfaced to clients in `ClientEvent::Error`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    #[default]
    GenericError = 0,
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
    ChannelEndpointError = 4,
    UnknownCounter = 5,
    UnknownCommand = 6,
    MalformedCommand = 7,
    NotSupported = 8,
    UnknownHost = 9,
    ResourceTemporarilyUnavailable = 10,
    ImageRejected = 11,
    ClientTimeout = 12,
    ConductorServiceTimeout = 13,
    StorageSpace = 14,
    UnauthorisedAction = 15,
    PublicationRevoked = 16,
}

/// Everything the conductor can fail a request with. Recovered locally:
/// surfaced to the requesting client, logged, counted, never thrown across
/// the agent loop boundary.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
    #[error("unknown publication: {0}")]
    UnknownPublication(i64),
    #[error("unknown subscription: {0}")]
    UnknownSubscription(i64),
    #[error("unknown counter: {0}")]
    UnknownCounter(i64),
    #[error("unknown command")]
    UnknownCommand,
    #[error("resource temporarily unavailable: {0}")]
    ResourceTemporarilyUnavailable(String),
    #[error("image rejected: {0}")]
    ImageRejected(String),
    #[error("unauthorised action: {0}")]
    UnauthorisedAction(String),
    #[error("storage space: {0}")]
    StorageSpace(String),
    #[error("{0}")]
    Generic(String),
    #[error("log buffer: {0}")]
    LogBuffer(#[from] LogBufferError),
    #[error("counters: {0}")]
    Counters(#[from] CountersError),
    #[error("control ring: {0}")]
    Ring(#[from] RingError),
}

impl DriverError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidChannel(_) | Self::LogBuffer(_) => ErrorCode::InvalidChannel,
            Self::UnknownPublication(_) => ErrorCode::UnknownPublication,
            Self::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            Self::UnknownCounter(_) => ErrorCode::UnknownCounter,
            Self::UnknownCommand => ErrorCode::UnknownCommand,
            Self::ResourceTemporarilyUnavailable(_) | Self::Ring(_) => {
                ErrorCode::ResourceTemporarilyUnavailable
            }
            Self::ImageRejected(_) => ErrorCode::ImageRejected,
            Self::UnauthorisedAction(_) => ErrorCode::UnauthorisedAction,
            Self::StorageSpace(_) => ErrorCode::StorageSpace,
            Self::Generic(_) | Self::Counters(_) => ErrorCode::GenericError,
        }
    }
}
