use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogBufferError {
    #[error("term length {0} must be a power of two in [64KiB, 1GiB]")]
    InvalidTermLength(usize),
    #[error("page size {0} must be a power of two in [4KiB, 1GiB]")]
    InvalidPageSize(usize),
    #[error("message length {length} exceeds max {max}")]
    MessageTooLong { length: usize, max: usize },
    #[error("mapped file is {actual} bytes, expected at least {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("shared memory file does not exist")]
    NonExistingFile,
    #[error("shmem error")]
    Shmem(#[from] ShmemError),
}

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecvError {
    /// Consumer fell behind and the producer lapped it.
    #[error("got lapped by the producer")]
    Lapped,
    #[error("ring empty")]
    Empty,
}

#[derive(Error, Debug)]
pub enum RingError {
    #[error("ring not initialized")]
    UnInitialized,
    #[error("ring length not power of two")]
    LengthNotPowerOfTwo,
    #[error("element size changed from {0} to {1}; reinit the ring after detaching processes")]
    ElementSizeChanged(usize, usize),
    #[error("ring full")]
    Full,
    #[error("preexisting shared memory too small")]
    TooSmall,
    #[error("shared memory file does not exist")]
    NonExistingFile,
    #[error("shmem error")]
    Shmem(#[from] ShmemError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CountersError {
    #[error("no free counter slots")]
    Exhausted,
    #[error("counter key of {0} bytes exceeds max")]
    KeyTooLong(usize),
    #[error("counter label of {0} bytes exceeds max")]
    LabelTooLong(usize),
    #[error(
        "counter (typeId={type_id}, registrationId={registration_id}) collides with an existing static counter"
    )]
    CollidesWithStatic { type_id: i32, registration_id: i64 },
    #[error(
        "static counter (typeId={type_id}, registrationId={registration_id}) collides with a non-static counter"
    )]
    CollidesWithNonStatic { type_id: i32, registration_id: i64 },
    #[error("counter {0} is not allocated")]
    NotAllocated(i32),
}
