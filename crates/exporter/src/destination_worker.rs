//! Destination worker (C6): the state machine {Idle, Batching, Flushing,
//! RetryBackoff, Fatal} that owns a durable queue between the graph and
//! whatever `DestinationSink` actually ships events out. Grounded on the
//! original `LogThrDestDriver`/`LogThrDestWorker` (`lib/logthrdestdrv.h`,
//! `lib/logthrdest/logthrdestdrv.h`): one worker per concurrency slot,
//! batching writes and retrying with exponential backoff on failure.

use std::time::Duration;

use async_trait::async_trait;
use codec::OnErrorFlags;
use event::{AckOutcome, Event};
use queue::{MemoryQueue, PersistentQueue};
use signal::{Signal, SignalReceiver};

use crate::effect::EffectHandler;
use crate::{EngineHandler, Error};

/// Where a batch of events is actually shipped. Implemented per
/// destination type; this crate carries no concrete network client, so
/// [`StdoutSink`] stands in as the reference implementation.
#[async_trait]
pub trait DestinationSink: Send {
    /// Attempts to deliver `batch` in order. Returns the number of
    /// leading events that were durably accepted by the destination;
    /// a return value less than `batch.len()` means the remaining
    /// suffix must be retried or requeued.
    async fn send(&mut self, batch: &[Event]) -> Result<usize, String>;
}

/// Writes each event's `msg` field (or a placeholder) to stdout, one
/// line per event. Always succeeds; meant for examples and tests.
#[derive(Default)]
pub struct StdoutSink;

#[async_trait]
impl DestinationSink for StdoutSink {
    async fn send(&mut self, batch: &[Event]) -> Result<usize, String> {
        for event in batch {
            match event.get("message") {
                Some(event::Value::String(s)) => println!("{s}"),
                _ => println!("<event id={}>", event.id()),
            }
        }
        Ok(batch.len())
    }
}

/// The worker's lifecycle state (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Batching,
    Flushing,
    RetryBackoff,
    Fatal,
}

/// Exponential backoff capped at a configured maximum, reset on success.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn next(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.max);
        wait
    }
}

/// Static configuration for a `DestinationWorker`.
pub struct DestinationWorkerConfig {
    /// Max events accumulated before a batch is flushed.
    pub batch_size: usize,
    /// Max time an incomplete batch waits before flushing anyway.
    pub batch_deadline: Duration,
    /// Initial retry backoff.
    pub backoff_initial: Duration,
    /// Maximum retry backoff.
    pub backoff_max: Duration,
    /// Capacity of the worker's internal durable queue.
    pub queue_capacity: usize,
    /// `on-error` policy applied when the queue is full.
    pub on_error: OnErrorFlags,
}

impl Default for DestinationWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_deadline: Duration::from_millis(1000),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            queue_capacity: 10_000,
            on_error: OnErrorFlags::default(),
        }
    }
}

/// The destination-worker state machine.
pub struct DestinationWorker {
    name: String,
    config: DestinationWorkerConfig,
    queue: Box<dyn PersistentQueue>,
    sink: Box<dyn DestinationSink>,
    backoff: Backoff,
    state: State,
}

impl DestinationWorker {
    /// Builds a worker backed by a process-memory queue (durable disk
    /// queues are wired in by the caller via [`DestinationWorker::with_queue`]).
    pub fn new(name: String, config: DestinationWorkerConfig, sink: Box<dyn DestinationSink>) -> Self {
        let queue: Box<dyn PersistentQueue> =
            Box::new(MemoryQueue::new(config.queue_capacity, usize::MAX));
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            name,
            config,
            queue,
            sink,
            backoff,
            state: State::Idle,
        }
    }

    /// Replaces the default memory queue (e.g. with `queue::DiskQueue`).
    pub fn with_queue(mut self, queue: Box<dyn PersistentQueue>) -> Self {
        self.queue = queue;
        self
    }

    fn enqueue(&mut self, event: Event) {
        if self.queue.is_full() {
            if !self.config.on_error.contains(OnErrorFlags::SILENT) {
                tracing::warn!(exporter = %self.name, "destination queue full, dropping event");
            }
            let mut internal_event = Event::new(event::EventMeta {
                program: Some(self.name.clone().into()),
                ..Default::default()
            });
            let _ = internal_event.set("message", event::Value::String("destination queue full, dropping event".into()));
            event::internal::report(internal_event);
            event.set_disposition(AckOutcome::Dropped);
            event.unref();
            return;
        }
        if let Err(err) = self.queue.push(event) {
            tracing::error!(exporter = %self.name, %err, "failed to enqueue event");
        }
    }

    /// Restores an undelivered event to the head of the queue, ahead of
    /// anything enqueued after it, so a failed batch's original order
    /// is preserved for the next attempt rather than getting stuck
    /// behind newer arrivals.
    fn requeue(&mut self, event: Event) {
        if let Err(err) = self.queue.push_front(event) {
            tracing::error!(exporter = %self.name, %err, "failed to requeue event");
        }
    }

    async fn flush_once(&mut self) {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        while batch.len() < self.config.batch_size {
            match self.queue.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        if batch.is_empty() {
            return;
        }
        self.state = State::Flushing;
        match self.sink.send(&batch).await {
            Ok(delivered) if delivered >= batch.len() => {
                for event in &batch {
                    event.set_disposition(AckOutcome::Delivered);
                }
                drop(batch);
                self.queue.ack(delivered);
                self.backoff.reset();
                self.state = State::Idle;
            }
            Ok(delivered) => {
                for event in batch.iter().take(delivered) {
                    event.set_disposition(AckOutcome::Delivered);
                }
                let suffix: Vec<Event> = batch.drain(delivered..).collect();
                drop(batch);
                self.queue.ack(delivered);
                for event in suffix.into_iter().rev() {
                    self.requeue(event);
                }
                self.backoff.reset();
                self.state = State::Idle;
            }
            Err(err) => {
                tracing::warn!(exporter = %self.name, %err, "flush failed, entering retry backoff");
                for event in batch.into_iter().rev() {
                    // requeue the whole batch for the next attempt, each
                    // call restoring one event to the queue's head so
                    // the batch's original order survives the retry.
                    self.requeue(event);
                }
                self.state = State::RetryBackoff;
                tokio::time::sleep(self.backoff.next()).await;
                self.state = State::Idle;
            }
        }
    }
}

#[async_trait]
impl crate::AsyncExporter<Event> for DestinationWorker {
    async fn init(&mut self, _engine_handler: &mut EngineHandler) -> Result<(), Error> {
        Ok(())
    }

    async fn export(
        &mut self,
        mut signal_receiver: SignalReceiver<Event>,
        _effect_handler: EffectHandler<Event>,
    ) -> Result<(), Error> {
        loop {
            self.state = State::Batching;
            match signal_receiver.recv().await {
                Signal::Messages { messages } => {
                    for event in messages {
                        self.enqueue(event);
                    }
                    if self.queue.len() >= self.config.batch_size {
                        self.flush_once().await;
                    }
                }
                Signal::TimerTick { .. } => {
                    self.flush_once().await;
                }
                Signal::Stop => {
                    while self.queue.len() > 0 {
                        self.flush_once().await;
                    }
                    return Ok(());
                }
                _ => {
                    self.state = State::Fatal;
                    return Err(Error::UnsupportedEvent {
                        exporter: self.name.clone(),
                        signal: "unknown".into(),
                    });
                }
            }
        }
    }
}
