#![deny(unsafe_code)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Persistent queue (C4): the bounded ordered buffer between the graph
//! head and a destination worker. Two backends share one contract:
//! [`memory::MemoryQueue`] (bounded by count and an approximate byte
//! budget) and [`disk::DiskQueue`] (a segmented, crash-recoverable
//! append-only log, §4.4).

mod disk;
mod frame;
mod memory;

pub use disk::DiskQueue;
pub use frame::{FrameError, FrameType};
pub use memory::MemoryQueue;

use event::Event;
use thiserror::Error;

/// Errors a queue backend can raise.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Both count and byte bounds (memory), or the caller's policy
    /// (disk, at configured high-water), are exhausted.
    #[error("queue is full")]
    Full,
    /// I/O failure writing or reading a disk segment.
    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared contract implemented by both queue backends.
pub trait PersistentQueue: Send + Sync {
    /// Enqueues an event at the tail. Fails with [`QueueError::Full`]
    /// when the backend's capacity is exhausted.
    fn push(&self, event: Event) -> Result<(), QueueError>;

    /// Dequeues the event at the head, if any. The record remains
    /// "in flight" (not durably released) until [`Self::ack`] confirms
    /// it.
    fn pop(&self) -> Option<Event>;

    /// Restores a popped-but-undelivered event to the head of the
    /// queue, ahead of anything still waiting, instead of the tail. A
    /// caller requeuing a whole failed batch calls this once per event
    /// in reverse pop order, so the batch's original relative order is
    /// preserved once every event is back in the queue. Bypasses the
    /// capacity check `push` applies, since the record was already
    /// accounted for.
    fn push_front(&self, event: Event) -> Result<(), QueueError>;

    /// Confirms that the oldest `count` in-flight (popped) records have
    /// been durably delivered or dropped by the destination worker,
    /// releasing the queue's own reference to them and, for disk
    /// backends, advancing the head marker and unlinking any segment
    /// that is now entirely behind it.
    fn ack(&self, count: usize);

    /// Number of records currently held (popped-but-unacked plus
    /// not-yet-popped).
    fn len(&self) -> usize;

    /// Whether the queue is at (or over) capacity.
    fn is_full(&self) -> bool;

    /// Convenience: `len() == 0`.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
