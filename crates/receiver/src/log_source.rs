//! The concrete log source (C7): the only `AsyncReceiver<event::Event>`
//! implementation in this crate. Binds a transport (TCP/UDP) to a codec,
//! a window, and an ack tracker, implementing the source pump contract:
//! read bytes, parse a frame, request window credit, attach the event
//! to the tracker, hand it to the graph. Grounded on the original
//! `LogSource` (`lib/logsource.h`) which performs exactly this loop
//! around a `LogProtoServer`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use codec::{Codec, JsonCodec, LineSyslogCodec, OnErrorFlags, ParseOutcome, Rfc5424Codec};
use event::{Bookmark, Event};
use persist::PersistFile;
use serde::Deserialize;
use serde_yaml::Value;
use window::WindowSizeCounter;

use ack::{AckTracker, PositionCommit, Strategy};

use crate::effect::EffectHandler;
use crate::signal::{Signal, SignalReceiver};
use crate::transport::{Chunk, TcpListenerTransport, Transport, UdpTransport};
use crate::{EngineHandler, Error};

/// Configuration accepted by a `log_source` receiver entry.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSourceConfig {
    /// Address to bind, e.g. `"0.0.0.0:514"`.
    pub bind: String,
    /// `"tcp"` or `"udp"`.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// `"line_syslog"`, `"rfc5424"`, or `"json"`.
    #[serde(default = "default_format")]
    pub format: String,
    /// `on-error` flag set, parsed by [`codec::parse_on_error`].
    #[serde(default = "default_on_error")]
    pub on_error: String,
    /// Static window capacity (C3).
    #[serde(default = "default_window_capacity")]
    pub window_capacity: u32,
    /// `"instant"`, `"early"`, or `"batched"` (C2).
    #[serde(default = "default_ack_strategy")]
    pub ack_strategy: String,
}

fn default_transport() -> String {
    "tcp".into()
}
fn default_format() -> String {
    "line_syslog".into()
}
fn default_on_error() -> String {
    "drop-message".into()
}
fn default_window_capacity() -> u32 {
    1000
}
fn default_ack_strategy() -> String {
    "batched".into()
}

/// Per-source window counters, keyed by receiver name and shared across
/// reconfiguration so a reload reuses the same in-flight credit
/// accounting for a source instead of resetting it (§4.8).
pub type WindowRegistry = Arc<StdMutex<HashMap<String, Arc<WindowSizeCounter>>>>;

fn parse_strategy(s: &str) -> Strategy {
    match s {
        "early" => Strategy::Early,
        "batched" => Strategy::Batched,
        _ => Strategy::Instant,
    }
}

fn build_codec(format: &str) -> Box<dyn Codec> {
    match format {
        "rfc5424" => Box::new(Rfc5424Codec),
        "json" => Box::new(JsonCodec),
        _ => Box::new(LineSyslogCodec),
    }
}

/// Durably records the committed position under `"<source_name>.bookmark"`
/// so a restarted process resumes from the last committed position
/// instead of replaying from the start (§4.3(c)).
struct PersistedPositionCommit {
    source_name: String,
    persist: Arc<PersistFile>,
}

impl PersistedPositionCommit {
    fn key(&self) -> String {
        format!("{}.bookmark", self.source_name)
    }
}

impl PositionCommit for PersistedPositionCommit {
    fn commit(&self, bookmark: &Bookmark) {
        tracing::trace!(source = %self.source_name, bookmark = ?bookmark, "position committed");
        if let Err(err) = self.persist.set(&self.key(), Bytes::copy_from_slice(bookmark.as_bytes())) {
            tracing::error!(source = %self.source_name, %err, "failed to persist committed position");
        }
    }
}

/// A source that reads framed log records off a TCP or UDP transport.
pub struct LogSource {
    name: String,
    config: LogSourceConfig,
    codec: Box<dyn Codec>,
    on_error: OnErrorFlags,
    window: Arc<WindowSizeCounter>,
    ack_tracker: Arc<AckTracker>,
    bookmark_seq: AtomicU64,
}

impl LogSource {
    /// Builds a source from a receiver name and its YAML configuration.
    ///
    /// `persist` durably records this source's committed position
    /// (§4.3(c)). `windows` is a registry of window counters keyed by
    /// receiver name, shared with every build of this factory so a
    /// reload (§4.8) reuses the same counter for a given source name
    /// instead of resetting its in-flight credit.
    pub fn from_config(
        name: String,
        config: Value,
        persist: Arc<PersistFile>,
        windows: WindowRegistry,
    ) -> Result<Self, Error> {
        let config: LogSourceConfig =
            serde_yaml::from_value(config).map_err(|e| Error::InvalidConfig {
                receiver: name.clone(),
                message: e.to_string(),
                line: None,
                column: None,
            })?;
        let on_error = codec::parse_on_error(&config.on_error).unwrap_or_default();
        let window = windows
            .lock()
            .expect("window registry mutex poisoned")
            .entry(name.clone())
            .or_insert_with(|| Arc::new(WindowSizeCounter::new(config.window_capacity)))
            .clone();
        let ack_tracker = AckTracker::new(
            parse_strategy(&config.ack_strategy),
            window.clone(),
            Arc::new(PersistedPositionCommit { source_name: name.clone(), persist }),
        );
        let codec = build_codec(&config.format);
        Ok(Self {
            name,
            config,
            codec,
            on_error,
            window,
            ack_tracker,
            bookmark_seq: AtomicU64::new(0),
        })
    }

    fn next_bookmark(&self, peer: SocketAddr) -> Bookmark {
        let seq = self.bookmark_seq.fetch_add(1, Ordering::Relaxed);
        let mut bytes = peer.to_string().into_bytes();
        bytes.extend_from_slice(&seq.to_le_bytes());
        Bookmark::new(bytes)
    }

    /// Waits (polling the window at a short interval) until at least one
    /// unit of credit is available, or a stop signal arrives. Returns
    /// `false` if a stop signal arrived first.
    async fn await_credit(&self, signal_receiver: &mut SignalReceiver) -> bool {
        loop {
            if self.window.request(1) == 1 {
                return true;
            }
            tokio::select! {
                biased;
                signal = signal_receiver.recv() => {
                    if matches!(signal, Signal::Stop) {
                        return false;
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
            }
        }
    }

    /// Parses and dispatches as many complete frames as `buf` currently
    /// holds, leaving any trailing partial frame in place.
    async fn drain_frames(
        &self,
        buf: &mut BytesMut,
        peer: SocketAddr,
        signal_receiver: &mut SignalReceiver,
        effect_handler: &EffectHandler<Event>,
    ) -> Result<(), Error> {
        loop {
            match self.codec.parse(&buf[..], self.on_error) {
                ParseOutcome::NeedMore => return Ok(()),
                ParseOutcome::Parsed { mut event, consumed } => {
                    let _ = buf.split_to(consumed);
                    if !self.await_credit(signal_receiver).await {
                        return Ok(());
                    }
                    let bookmark = self.next_bookmark(peer);
                    event
                        .bind(self.ack_tracker.clone(), bookmark.clone())
                        .map_err(|e| Error::Receiver {
                            receiver: self.name.clone(),
                            error: e.to_string(),
                            context: Default::default(),
                        })?;
                    self.ack_tracker.attach(bookmark.clone());
                    self.ack_tracker.on_enqueued(&bookmark);
                    effect_handler.send_messages(vec![event]).await?;
                }
                ParseOutcome::Error { error, consumed } => {
                    tracing::warn!(source = %self.name, %error, "dropping malformed frame");
                    let _ = buf.split_to(consumed.max(1));
                }
            }
        }
    }

    async fn pump_chunks(
        &self,
        mut transport: Box<dyn Transport>,
        signal_receiver: &mut SignalReceiver,
        effect_handler: &EffectHandler<Event>,
    ) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        loop {
            let chunk: Option<Chunk> = tokio::select! {
                biased;
                signal = signal_receiver.recv() => {
                    if matches!(signal, Signal::Stop) {
                        return Ok(());
                    }
                    continue;
                }
                chunk = transport.recv() => chunk?,
            };
            match chunk {
                None => return Ok(()),
                Some(chunk) => {
                    buf.extend_from_slice(&chunk.bytes);
                    self.drain_frames(&mut buf, chunk.peer, signal_receiver, effect_handler)
                        .await?;
                }
            }
        }
    }
}

#[async_trait]
impl crate::AsyncReceiver<Event> for LogSource {
    async fn init(&mut self, _engine_handler: EngineHandler) -> Result<(), Error> {
        Ok(())
    }

    async fn receive(
        &mut self,
        mut signal_receiver: SignalReceiver,
        effect_handler: EffectHandler<Event>,
    ) -> Result<(), Error> {
        let addr: SocketAddr = self.config.bind.parse().map_err(|e: std::net::AddrParseError| {
            Error::InvalidConfig {
                receiver: self.name.clone(),
                message: e.to_string(),
                line: None,
                column: None,
            }
        })?;

        match self.config.transport.as_str() {
            "udp" => {
                let transport = UdpTransport::bind(addr).await?;
                self.pump_chunks(Box::new(transport), &mut signal_receiver, &effect_handler).await
            }
            _ => {
                let listener = TcpListenerTransport::bind(addr, &effect_handler).await?;
                loop {
                    let accepted = tokio::select! {
                        biased;
                        signal = signal_receiver.recv() => {
                            if matches!(signal, Signal::Stop) {
                                return Ok(());
                            }
                            continue;
                        }
                        accepted = listener.accept() => accepted?,
                    };
                    // A LogSource is single-tasked in this implementation: one
                    // connection is drained to completion before the next is
                    // accepted. Concurrent TCP fan-in is achieved by
                    // configuring several `log_source` receivers bound to the
                    // same `SO_REUSEPORT` address rather than spawning nested
                    // tasks here, keeping ownership of the window/ack tracker
                    // single-threaded per the engine's per-receiver task model.
                    self.pump_chunks(Box::new(accepted), &mut signal_receiver, &effect_handler)
                        .await?;
                }
            }
        }
    }
}
