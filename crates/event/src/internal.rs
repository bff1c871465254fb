//! Process-wide channel for internal diagnostic events (§7): error
//! paths with no local recovery push a structured [`Event`] here
//! instead of only logging it. Kept in this crate (rather than nearer
//! its one consumer, `receiver::internal_source`) so every crate that
//! already depends on `event` can report without a reverse dependency
//! on `receiver`.

use std::sync::OnceLock;

use tokio::sync::mpsc;

use crate::Event;

static SENDER: OnceLock<mpsc::Sender<Event>> = OnceLock::new();

/// Installs the channel's sending half and returns its receiving half.
/// Called once by `receiver::internal_source::InternalSource` when an
/// `internal` receiver is configured. A second call returns `None`.
pub fn install(capacity: usize) -> Option<mpsc::Receiver<Event>> {
    let (tx, rx) = mpsc::channel(capacity);
    SENDER.set(tx).ok()?;
    Some(rx)
}

/// Pushes an internal diagnostic event if an `internal` receiver has
/// called [`install`]; a no-op otherwise. Never blocks: a full channel
/// drops the event rather than stalling the caller's own error path.
pub fn report(event: Event) {
    if let Some(sender) = SENDER.get() {
        let _ = sender.try_send(event);
    }
}
