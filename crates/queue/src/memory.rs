//! Memory-only queue: bounded by event count and an approximate byte
//! budget (§4.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use event::Event;
use parking_lot::Mutex;

use crate::{PersistentQueue, QueueError};

struct Entry {
    event: Event,
    size: usize,
}

/// A FIFO queue that never touches disk; `push` fails with
/// [`QueueError::Full`] once either bound is exceeded.
pub struct MemoryQueue {
    max_events: usize,
    max_bytes: usize,
    bytes: AtomicUsize,
    entries: Mutex<VecDeque<Entry>>,
}

impl MemoryQueue {
    /// Creates a queue bounded by `max_events` records and
    /// `max_bytes` of approximate marshaled size.
    pub fn new(max_events: usize, max_bytes: usize) -> Self {
        Self {
            max_events,
            max_bytes,
            bytes: AtomicUsize::new(0),
            entries: Mutex::new(VecDeque::new()),
        }
    }
}

impl PersistentQueue for MemoryQueue {
    fn push(&self, event: Event) -> Result<(), QueueError> {
        let size = event.marshal().len();
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_events {
            return Err(QueueError::Full);
        }
        if self.bytes.load(Ordering::Acquire) + size > self.max_bytes {
            return Err(QueueError::Full);
        }
        self.bytes.fetch_add(size, Ordering::AcqRel);
        entries.push_back(Entry { event, size });
        Ok(())
    }

    fn push_front(&self, event: Event) -> Result<(), QueueError> {
        let size = event.marshal().len();
        let mut entries = self.entries.lock();
        self.bytes.fetch_add(size, Ordering::AcqRel);
        entries.push_front(Entry { event, size });
        Ok(())
    }

    fn pop(&self) -> Option<Event> {
        let mut entries = self.entries.lock();
        let entry = entries.pop_front()?;
        self.bytes.fetch_sub(entry.size, Ordering::AcqRel);
        Some(entry.event)
    }

    fn ack(&self, _count: usize) {
        // Memory-only queues have nothing durable to truncate: `pop`
        // already released the slot.
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn is_full(&self) -> bool {
        let entries = self.entries.lock();
        entries.len() >= self.max_events || self.bytes.load(Ordering::Acquire) >= self.max_bytes
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use event::EventMeta;

    #[test]
    fn push_fails_once_count_cap_reached() {
        let q = MemoryQueue::new(2, 1_000_000);
        assert!(q.push(Event::new(EventMeta::default())).is_ok());
        assert!(q.push(Event::new(EventMeta::default())).is_ok());
        assert!(matches!(
            q.push(Event::new(EventMeta::default())),
            Err(QueueError::Full)
        ));
    }

    #[test]
    fn pop_is_fifo() {
        let q = MemoryQueue::new(10, 1_000_000);
        let mut a = Event::new(EventMeta::default());
        a.set("i", event::Value::Int64(1)).unwrap();
        let mut b = Event::new(EventMeta::default());
        b.set("i", event::Value::Int64(2)).unwrap();
        q.push(a).unwrap();
        q.push(b).unwrap();
        assert_eq!(q.pop().unwrap().get("i"), Some(&event::Value::Int64(1)));
        assert_eq!(q.pop().unwrap().get("i"), Some(&event::Value::Int64(2)));
        assert!(q.pop().is_none());
    }
}
