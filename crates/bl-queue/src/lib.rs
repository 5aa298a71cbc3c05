//! Outgoing work queue
//!
//! Merged payloads waiting for dispatch, ordered by priority then enqueue
//! time, plus the snapshot store that carries them across restarts.

pub mod error;
pub mod outgoing;
pub mod snapshot;

pub use error::QueueError;
pub use outgoing::OutgoingQueue;
pub use snapshot::SnapshotStore;

pub type Result<T> = std::result::Result<T, QueueError>;
