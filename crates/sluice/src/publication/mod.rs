pub mod ipc;
pub mod network;

/// Shared publication lifecycle. All transitions happen on the conductor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PubLifecycle {
    Active,
    Draining,
    Linger,
    Done,
}
