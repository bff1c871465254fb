#![deny(unsafe_code)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The event record (C1): an immutable-after-commit, refcounted, typed log
//! message that carries structured fields and an acknowledgement binding
//! back to the owning source's ack tracker.
//!
//! An `Event` is a thin `Arc` handle. Cloning an `Event` is the `ref()`
//! operation; dropping the last handle is `unref()`, which fires the
//! bound ack callback with whatever disposition (delivered/dropped) the
//! last holder recorded. This mirrors the refcount-owns-the-ack-callback
//! discipline of the payload the engine moves through its graph, while
//! keeping the firing point explicit instead of implicit in `Drop`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use thiserror::Error;

pub mod internal;

/// Name of a structured field. Field names are byte-strings in the
/// original model; `Arc<str>` gives cheap sharing across forked events
/// while still being a normal UTF-8 Rust string in practice.
pub type FieldName = Arc<str>;

/// An opaque, source-owned position blob used to record delivery
/// progress (file offset, broker offset, message id, ...).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Bookmark(Arc<[u8]>);

impl Bookmark {
    /// Builds a bookmark from raw bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// Borrows the bookmark's raw payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bookmark({} bytes)", self.0.len())
    }
}

/// Final disposition of an event, decided by whichever holder causes the
/// refcount to reach zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AckOutcome {
    /// The event was accepted by its destination (or, for instant/early
    /// trackers, reached the point their policy defines as committed).
    Delivered = 1,
    /// The event was dropped, per an `on-error` policy or a permanent
    /// destination failure.
    Dropped = 2,
}

/// Sink an event's ack binding fires into. Implemented by the ack
/// trackers in the `ack` crate; kept here so `event` has no dependency
/// on `ack` (the ack tracker depends on events, not the reverse).
pub trait AckSink: Send + Sync {
    /// Called exactly once, when the bound event's refcount reaches zero.
    fn ack(&self, bookmark: &Bookmark, outcome: AckOutcome);
}

/// The closed set of typed field values (§3).
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// Absence of a value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int64(i64),
    /// IEEE-754 double.
    Float64(f64),
    /// Nanoseconds since the Unix epoch, UTC.
    DateTime(i64),
    /// Raw byte string.
    Bytes(Bytes),
    /// UTF-8 string.
    String(Arc<str>),
    /// Opaque protobuf-encoded payload (message type is carried by the
    /// field that holds it, not by the value itself).
    Protobuf(Bytes),
    /// A list of values, copy-on-write shared.
    List(Arc<Vec<Value>>),
    /// A nested ordered mapping, copy-on-write shared.
    Mapping(Arc<IndexMap<FieldName, Value>>),
}

/// One-byte type tag used by `marshal`/`parse` to preserve the value's
/// type across a round trip (§4.1, §8 property 6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Null = 0,
    Bool = 1,
    Int64 = 2,
    Float64 = 3,
    DateTime = 4,
    Bytes = 5,
    String = 6,
    Protobuf = 7,
    List = 8,
    Mapping = 9,
}

impl Tag {
    fn from_u8(b: u8) -> Result<Self, EventError> {
        Ok(match b {
            0 => Tag::Null,
            1 => Tag::Bool,
            2 => Tag::Int64,
            3 => Tag::Float64,
            4 => Tag::DateTime,
            5 => Tag::Bytes,
            6 => Tag::String,
            7 => Tag::Protobuf,
            8 => Tag::List,
            9 => Tag::Mapping,
            other => return Err(EventError::Codec(format!("unknown type tag {other}"))),
        })
    }
}

/// Errors raised by event operations.
#[derive(Debug, Error)]
pub enum EventError {
    /// `set`/`bind` called on an event with more than one outstanding
    /// reference.
    #[error("event is shared; fork before mutating")]
    Shared,
    /// Mutation attempted on a read-only event.
    #[error("event is read-only")]
    ReadOnly,
    /// `bind` called a second time.
    #[error("event is already bound to an ack tracker")]
    AlreadyBound,
    /// Marshal/parse failure.
    #[error("event codec error: {0}")]
    Codec(String),
}

fn marshal_value(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Null => out.put_u8(Tag::Null as u8),
        Value::Bool(b) => {
            out.put_u8(Tag::Bool as u8);
            out.put_u8(*b as u8);
        }
        Value::Int64(v) => {
            out.put_u8(Tag::Int64 as u8);
            out.put_i64_le(*v);
        }
        Value::Float64(v) => {
            out.put_u8(Tag::Float64 as u8);
            out.put_f64_le(*v);
        }
        Value::DateTime(v) => {
            out.put_u8(Tag::DateTime as u8);
            out.put_i64_le(*v);
        }
        Value::Bytes(b) => {
            out.put_u8(Tag::Bytes as u8);
            out.put_u32_le(b.len() as u32);
            out.put_slice(b);
        }
        Value::String(s) => {
            out.put_u8(Tag::String as u8);
            let bytes = s.as_bytes();
            out.put_u32_le(bytes.len() as u32);
            out.put_slice(bytes);
        }
        Value::Protobuf(b) => {
            out.put_u8(Tag::Protobuf as u8);
            out.put_u32_le(b.len() as u32);
            out.put_slice(b);
        }
        Value::List(items) => {
            out.put_u8(Tag::List as u8);
            out.put_u32_le(items.len() as u32);
            for item in items.iter() {
                marshal_value(item, out);
            }
        }
        Value::Mapping(map) => {
            out.put_u8(Tag::Mapping as u8);
            out.put_u32_le(map.len() as u32);
            for (name, value) in map.iter() {
                let name_bytes = name.as_bytes();
                out.put_u32_le(name_bytes.len() as u32);
                out.put_slice(name_bytes);
                marshal_value(value, out);
            }
        }
    }
}

fn parse_value(buf: &mut impl Buf) -> Result<Value, EventError> {
    if !buf.has_remaining() {
        return Err(EventError::Codec("truncated value".into()));
    }
    let tag = Tag::from_u8(buf.get_u8())?;
    Ok(match tag {
        Tag::Null => Value::Null,
        Tag::Bool => Value::Bool(buf.get_u8() != 0),
        Tag::Int64 => Value::Int64(buf.get_i64_le()),
        Tag::Float64 => Value::Float64(buf.get_f64_le()),
        Tag::DateTime => Value::DateTime(buf.get_i64_le()),
        Tag::Bytes => {
            let len = buf.get_u32_le() as usize;
            Value::Bytes(buf.copy_to_bytes(len))
        }
        Tag::String => {
            let len = buf.get_u32_le() as usize;
            let raw = buf.copy_to_bytes(len);
            let s = std::str::from_utf8(&raw)
                .map_err(|e| EventError::Codec(e.to_string()))?
                .to_owned();
            Value::String(Arc::from(s))
        }
        Tag::Protobuf => {
            let len = buf.get_u32_le() as usize;
            Value::Protobuf(buf.copy_to_bytes(len))
        }
        Tag::List => {
            let len = buf.get_u32_le() as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(parse_value(buf)?);
            }
            Value::List(Arc::new(items))
        }
        Tag::Mapping => {
            let len = buf.get_u32_le() as usize;
            let mut map = IndexMap::with_capacity(len);
            for _ in 0..len {
                let name_len = buf.get_u32_le() as usize;
                let raw = buf.copy_to_bytes(name_len);
                let name: FieldName = Arc::from(
                    std::str::from_utf8(&raw).map_err(|e| EventError::Codec(e.to_string()))?,
                );
                let value = parse_value(buf)?;
                let _ = map.insert(name, value);
            }
            Value::Mapping(Arc::new(map))
        }
    })
}

impl Value {
    /// Serialises a single value, tagged so `parse` can recover its type.
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::new();
        marshal_value(self, &mut out);
        out.freeze()
    }

    /// Parses a value previously produced by `marshal`.
    pub fn parse(mut bytes: Bytes) -> Result<Value, EventError> {
        let value = parse_value(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(EventError::Codec("trailing bytes after value".into()));
        }
        Ok(value)
    }
}

/// The small set of well-known fields every event carries.
#[derive(Clone, Debug, Default)]
pub struct EventMeta {
    /// Nanoseconds since the Unix epoch, UTC.
    pub timestamp: Option<i64>,
    /// Originating host, if known.
    pub host: Option<Arc<str>>,
    /// Program/application name.
    pub program: Option<Arc<str>>,
    /// Process id of the program, if reported.
    pub pid: Option<i32>,
    /// Syslog severity (0-7).
    pub severity: Option<u8>,
    /// Syslog facility.
    pub facility: Option<u8>,
    /// The raw, unparsed message bytes, kept for fallback formatting.
    pub raw_message: Option<Bytes>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum Disposition {
    Dropped = AckOutcome::Dropped as u8,
    Delivered = AckOutcome::Delivered as u8,
}

/// The bookmark/sink pair bound to an event, shared (via `Arc`) across
/// every fork of that event so the sink fires exactly once when the
/// last descendant anywhere in the fork tree is dropped, rather than
/// once per fork.
struct AckBinding {
    bookmark: Bookmark,
    sink: Arc<dyn AckSink>,
    disposition: AtomicU8,
}

impl Drop for AckBinding {
    fn drop(&mut self) {
        let outcome = if self.disposition.load(Ordering::Acquire) == Disposition::Delivered as u8 {
            AckOutcome::Delivered
        } else {
            AckOutcome::Dropped
        };
        self.sink.ack(&self.bookmark, outcome);
    }
}

struct EventInner {
    id: u64,
    meta: EventMeta,
    fields: IndexMap<FieldName, Value>,
    ack_binding: Option<Arc<AckBinding>>,
    read_only: AtomicBool,
}

impl fmt::Debug for EventInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventInner")
            .field("id", &self.id)
            .field("fields", &self.fields.len())
            .field("bound", &self.ack_binding.is_some())
            .finish()
    }
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// A refcounted, typed log event moving through the pipeline graph.
#[derive(Clone, Debug)]
pub struct Event(Arc<EventInner>);

impl Event {
    /// Creates a new event with refcount 1 and no ack binding.
    pub fn new(meta: EventMeta) -> Self {
        Self(Arc::new(EventInner {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            fields: IndexMap::new(),
            ack_binding: None,
            read_only: AtomicBool::new(false),
        }))
    }

    /// Process-local monotonic identifier.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Well-known fields.
    pub fn meta(&self) -> &EventMeta {
        &self.0.meta
    }

    /// Binds this event to a source's ack tracker and records its
    /// bookmark. Must be called at most once, before the event is first
    /// handed off downstream, and requires sole ownership.
    pub fn bind(&mut self, sink: Arc<dyn AckSink>, bookmark: Bookmark) -> Result<(), EventError> {
        let inner = Arc::get_mut(&mut self.0).ok_or(EventError::Shared)?;
        if inner.ack_binding.is_some() {
            return Err(EventError::AlreadyBound);
        }
        inner.ack_binding = Some(Arc::new(AckBinding {
            bookmark,
            sink,
            disposition: AtomicU8::new(Disposition::Dropped as u8),
        }));
        Ok(())
    }

    /// The bookmark recorded by `bind`, if any.
    pub fn bookmark(&self) -> Option<&Bookmark> {
        self.0.ack_binding.as_ref().map(|binding| &binding.bookmark)
    }

    /// Increments the refcount; the explicit name for "duplicate a
    /// reference to this event", used at fan-out points.
    pub fn ref_(&self) -> Event {
        self.clone()
    }

    /// Records the disposition this holder believes is final. Only the
    /// disposition recorded by whichever holder causes the binding's
    /// last reference (across every fork of this event) to drop takes
    /// effect. A no-op on an unbound event.
    pub fn set_disposition(&self, outcome: AckOutcome) {
        if let Some(binding) = &self.0.ack_binding {
            binding.disposition.store(outcome as u8, Ordering::Release);
        }
    }

    /// Drops this reference. If it was the last one, the bound ack
    /// callback fires using the most recently recorded disposition.
    pub fn unref(self) {
        drop(self);
    }

    /// Looks up a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.fields.get(name)
    }

    /// Sets a field. Only valid when this event is exclusively owned
    /// (refcount 1) and not read-only; callers that don't hold sole
    /// ownership should `fork` first.
    pub fn set(&mut self, name: impl Into<FieldName>, value: Value) -> Result<(), EventError> {
        if self.is_read_only() {
            return Err(EventError::ReadOnly);
        }
        let inner = Arc::get_mut(&mut self.0).ok_or(EventError::Shared)?;
        let _ = inner.fields.insert(name.into(), value);
        Ok(())
    }

    /// Iterates fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.0.fields.iter()
    }

    /// Produces an independent event with a private copy of this
    /// event's fields and meta, refcount 1, sharing the same ack
    /// binding (if any) as the event it was forked from. The bound
    /// sink still fires exactly once, when the last of the original
    /// and every one of its forks has been dropped. Nested list/mapping
    /// values are shared copy-on-write until a caller mutates through a
    /// forked event's own `set`.
    pub fn fork(&self) -> Event {
        Event(Arc::new(EventInner {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            meta: self.0.meta.clone(),
            fields: self.0.fields.clone(),
            ack_binding: self.0.ack_binding.clone(),
            read_only: AtomicBool::new(false),
        }))
    }

    /// Marks this event (and, conceptually, its nested containers) as
    /// read-only. Once set, every `set` call on this handle fails.
    pub fn make_read_only(&self) {
        self.0.read_only.store(true, Ordering::Release);
    }

    /// Whether `make_read_only` has been called on this event.
    pub fn is_read_only(&self) -> bool {
        self.0.read_only.load(Ordering::Acquire)
    }

    /// Number of outstanding references to this event.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Serialises the full event (meta + fields) to bytes.
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::new();
        macro_rules! put_opt_str {
            ($opt:expr) => {
                match &$opt {
                    Some(s) => {
                        out.put_u8(1);
                        out.put_u32_le(s.len() as u32);
                        out.put_slice(s.as_bytes());
                    }
                    None => out.put_u8(0),
                }
            };
        }
        match self.0.meta.timestamp {
            Some(v) => {
                out.put_u8(1);
                out.put_i64_le(v);
            }
            None => out.put_u8(0),
        }
        put_opt_str!(self.0.meta.host);
        put_opt_str!(self.0.meta.program);
        match self.0.meta.pid {
            Some(v) => {
                out.put_u8(1);
                out.put_i32_le(v);
            }
            None => out.put_u8(0),
        }
        match self.0.meta.severity {
            Some(v) => {
                out.put_u8(1);
                out.put_u8(v);
            }
            None => out.put_u8(0),
        }
        match self.0.meta.facility {
            Some(v) => {
                out.put_u8(1);
                out.put_u8(v);
            }
            None => out.put_u8(0),
        }
        match &self.0.meta.raw_message {
            Some(raw) => {
                out.put_u8(1);
                out.put_u32_le(raw.len() as u32);
                out.put_slice(raw);
            }
            None => out.put_u8(0),
        }
        out.put_u32_le(self.0.fields.len() as u32);
        for (name, value) in self.0.fields.iter() {
            let name_bytes = name.as_bytes();
            out.put_u32_le(name_bytes.len() as u32);
            out.put_slice(name_bytes);
            marshal_value(value, &mut out);
        }
        out.freeze()
    }

    /// Parses an event previously produced by `marshal`. The resulting
    /// event is unbound; the caller re-binds it to a source/ack tracker.
    pub fn parse(mut bytes: Bytes) -> Result<Event, EventError> {
        fn opt_str(buf: &mut impl Buf) -> Result<Option<Arc<str>>, EventError> {
            if buf.get_u8() == 0 {
                return Ok(None);
            }
            let len = buf.get_u32_le() as usize;
            let raw = buf.copy_to_bytes(len);
            let s = std::str::from_utf8(&raw).map_err(|e| EventError::Codec(e.to_string()))?;
            Ok(Some(Arc::from(s)))
        }

        let mut meta = EventMeta::default();
        if bytes.get_u8() != 0 {
            meta.timestamp = Some(bytes.get_i64_le());
        }
        meta.host = opt_str(&mut bytes)?;
        meta.program = opt_str(&mut bytes)?;
        if bytes.get_u8() != 0 {
            meta.pid = Some(bytes.get_i32_le());
        }
        if bytes.get_u8() != 0 {
            meta.severity = Some(bytes.get_u8());
        }
        if bytes.get_u8() != 0 {
            meta.facility = Some(bytes.get_u8());
        }
        if bytes.get_u8() != 0 {
            let len = bytes.get_u32_le() as usize;
            meta.raw_message = Some(bytes.copy_to_bytes(len));
        }
        let field_count = bytes.get_u32_le() as usize;
        let mut fields = IndexMap::with_capacity(field_count);
        for _ in 0..field_count {
            let name_len = bytes.get_u32_le() as usize;
            let raw = bytes.copy_to_bytes(name_len);
            let name: FieldName =
                Arc::from(std::str::from_utf8(&raw).map_err(|e| EventError::Codec(e.to_string()))?);
            let value = parse_value(&mut bytes)?;
            let _ = fields.insert(name, value);
        }
        Ok(Event(Arc::new(EventInner {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            fields,
            ack_binding: None,
            read_only: AtomicBool::new(false),
        })))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        fired: Mutex<Vec<(Bookmark, AckOutcome)>>,
    }

    impl AckSink for RecordingSink {
        fn ack(&self, bookmark: &Bookmark, outcome: AckOutcome) {
            self.fired.lock().unwrap().push((bookmark.clone(), outcome));
        }
    }

    #[test]
    fn value_round_trip_preserves_type() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int64(-7),
            Value::Float64(3.5),
            Value::DateTime(123456789),
            Value::Bytes(Bytes::from_static(b"\x00\x01\x02")),
            Value::String(Arc::from("hello")),
            Value::Protobuf(Bytes::from_static(b"\x08\x01")),
            Value::List(Arc::new(vec![Value::Int64(1), Value::Bool(false)])),
        ];
        for v in values {
            let marshaled = v.marshal();
            let parsed = Value::parse(marshaled).expect("parse");
            assert_eq!(parsed, v);
        }
    }

    #[test]
    fn event_marshal_round_trip() {
        let mut ev = Event::new(EventMeta {
            timestamp: Some(1),
            host: Some(Arc::from("h")),
            program: Some(Arc::from("p")),
            pid: Some(42),
            severity: Some(6),
            facility: Some(1),
            raw_message: Some(Bytes::from_static(b"raw")),
        });
        ev.set("msg", Value::String(Arc::from("hi"))).unwrap();
        let bytes = ev.marshal();
        let parsed = Event::parse(bytes).unwrap();
        assert_eq!(parsed.meta().host.as_deref(), Some("h"));
        assert_eq!(parsed.get("msg"), Some(&Value::String(Arc::from("hi"))));
    }

    #[test]
    fn set_requires_exclusive_ownership() {
        let mut ev = Event::new(EventMeta::default());
        let _ref2 = ev.ref_();
        assert_eq!(ev.ref_count(), 2);
        assert!(matches!(ev.set("x", Value::Null), Err(EventError::Shared)));
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut ev = Event::new(EventMeta::default());
        ev.make_read_only();
        assert!(matches!(ev.set("x", Value::Null), Err(EventError::ReadOnly)));
    }

    #[test]
    fn ack_fires_exactly_once_on_last_unref() {
        let sink = Arc::new(RecordingSink {
            fired: Mutex::new(Vec::new()),
        });
        let mut ev = Event::new(EventMeta::default());
        let bookmark = Bookmark::new(vec![1, 2, 3]);
        ev.bind(sink.clone(), bookmark.clone()).unwrap();

        let ev2 = ev.ref_();
        drop(ev2);
        assert!(sink.fired.lock().unwrap().is_empty(), "ack must not fire early");

        ev.set_disposition(AckOutcome::Delivered);
        ev.unref();

        let fired = sink.fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, bookmark);
        assert_eq!(fired[0].1, AckOutcome::Delivered);
    }

    #[test]
    fn fork_has_independent_fields() {
        let mut ev = Event::new(EventMeta::default());
        ev.set("k", Value::Int64(1)).unwrap();
        let mut forked = ev.fork();
        forked.set("k", Value::Int64(2)).unwrap();
        assert_eq!(ev.get("k"), Some(&Value::Int64(1)));
        assert_eq!(forked.get("k"), Some(&Value::Int64(2)));
    }

    #[test]
    fn fork_carries_ack_binding_and_fires_once() {
        let sink = Arc::new(RecordingSink {
            fired: Mutex::new(Vec::new()),
        });
        let mut ev = Event::new(EventMeta::default());
        let bookmark = Bookmark::new(vec![9]);
        ev.bind(sink.clone(), bookmark.clone()).unwrap();

        let forked = ev.fork();
        assert_eq!(forked.bookmark(), Some(&bookmark));

        ev.set_disposition(AckOutcome::Delivered);
        ev.unref();
        assert!(sink.fired.lock().unwrap().is_empty(), "ack must wait for every fork to drop");

        forked.unref();
        let fired = sink.fired.lock().unwrap();
        assert_eq!(fired.len(), 1, "ack must fire exactly once across the whole fork tree");
        assert_eq!(fired[0].0, bookmark);
        assert_eq!(fired[0].1, AckOutcome::Delivered);
    }
}
