mod buffer;
mod counters;
pub mod descriptor;
mod error;
mod error_log;
pub mod frame;
mod log;
mod loss_report;
mod position;
mod region;
pub mod ring;
mod seqlock;

pub use buffer::AtomicBuffer;
pub use counters::{
    CounterState, CounterTable, KEY_MAX_LENGTH, LABEL_MAX_LENGTH, METADATA_RECORD_LENGTH,
    NULL_COUNTER_ID, NULL_OWNER_ID, NULL_REGISTRATION_ID, VALUE_RECORD_LENGTH,
};
pub use error::{CountersError, LogBufferError, RecvError, RingError};
pub use error_log::DistinctErrorLog;
pub use log::{Claim, LogBuffers};
pub use loss_report::{LossEntry, LossObservation, LossReport};
pub use position::Position;
pub use region::MappedRegion;
pub use seqlock::Seqlock;
