//! JSON codec: one event per line, each line a JSON object whose keys
//! become field names.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use event::{Event, EventMeta, Value as EventValue};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::{Codec, CodecError, OnErrorFlags, ParseOutcome};

/// Line-delimited JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

fn json_to_event_value(value: JsonValue) -> EventValue {
    match value {
        JsonValue::Null => EventValue::Null,
        JsonValue::Bool(b) => EventValue::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                EventValue::Int64(i)
            } else {
                EventValue::Float64(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => EventValue::String(Arc::from(s.as_str())),
        JsonValue::Array(items) => {
            EventValue::List(Arc::new(items.into_iter().map(json_to_event_value).collect()))
        }
        JsonValue::Object(map) => {
            let mut out = IndexMap::with_capacity(map.len());
            for (k, v) in map {
                let _ = out.insert(Arc::from(k.as_str()), json_to_event_value(v));
            }
            EventValue::Mapping(Arc::new(out))
        }
    }
}

fn event_value_to_json(value: &EventValue) -> JsonValue {
    match value {
        EventValue::Null => JsonValue::Null,
        EventValue::Bool(b) => JsonValue::Bool(*b),
        EventValue::Int64(v) => JsonValue::from(*v),
        EventValue::Float64(v) => {
            serde_json::Number::from_f64(*v).map(JsonValue::Number).unwrap_or(JsonValue::Null)
        }
        EventValue::DateTime(v) => JsonValue::from(*v),
        EventValue::Bytes(b) => JsonValue::String(data_encoding::HEXLOWER.encode(b)),
        EventValue::String(s) => JsonValue::String(s.to_string()),
        EventValue::Protobuf(b) => JsonValue::String(data_encoding::HEXLOWER.encode(b)),
        EventValue::List(items) => JsonValue::Array(items.iter().map(event_value_to_json).collect()),
        EventValue::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map.iter() {
                let _ = out.insert(k.to_string(), event_value_to_json(v));
            }
            JsonValue::Object(out)
        }
    }
}

fn find_newline(input: &[u8]) -> Option<usize> {
    input.iter().position(|&b| b == b'\n')
}

impl Codec for JsonCodec {
    fn parse(&self, input: &[u8], on_error: OnErrorFlags) -> ParseOutcome {
        let newline = match find_newline(input) {
            Some(pos) => pos,
            None => return ParseOutcome::NeedMore,
        };
        let consumed = newline + 1;
        let line = &input[..newline];
        let parsed: Result<JsonValue, _> = serde_json::from_slice(line);
        match parsed {
            Ok(JsonValue::Object(map)) => {
                let mut event = Event::new(EventMeta::default());
                for (k, v) in map {
                    event
                        .set(k, json_to_event_value(v))
                        .expect("exclusively owned");
                }
                ParseOutcome::Parsed { event, consumed }
            }
            Ok(_) => ParseOutcome::Error {
                error: CodecError::Malformed("top-level JSON value must be an object".into()),
                consumed,
            },
            Err(e) => {
                if on_error.contains(OnErrorFlags::FALLBACK_TO_STRING) {
                    let mut event = Event::new(EventMeta {
                        raw_message: Some(bytes::Bytes::copy_from_slice(line)),
                        ..Default::default()
                    });
                    let raw = String::from_utf8_lossy(line).into_owned();
                    event
                        .set("message", EventValue::String(Arc::from(raw.as_str())))
                        .expect("exclusively owned");
                    event
                        .set(".error", EventValue::String(Arc::from(e.to_string().as_str())))
                        .expect("exclusively owned");
                    ParseOutcome::Parsed { event, consumed }
                } else {
                    ParseOutcome::Error {
                        error: CodecError::Malformed(e.to_string()),
                        consumed,
                    }
                }
            }
        }
    }

    fn format(&self, event: &Event, out: &mut BytesMut) -> usize {
        let start = out.len();
        let mut map = serde_json::Map::new();
        for (k, v) in event.fields() {
            let _ = map.insert(k.to_string(), event_value_to_json(v));
        }
        let rendered = serde_json::to_vec(&JsonValue::Object(map)).unwrap_or_default();
        out.put_slice(&rendered);
        out.len() - start
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_json_object_fields() {
        let codec = JsonCodec;
        let input = b"{\"message\":\"hi\",\"n\":1}\n";
        match codec.parse(input, OnErrorFlags::default()) {
            ParseOutcome::Parsed { event, consumed } => {
                assert_eq!(consumed, input.len());
                assert_eq!(event.get("message"), Some(&EventValue::String(Arc::from("hi"))));
                assert_eq!(event.get("n"), Some(&EventValue::Int64(1)));
            }
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn malformed_json_without_fallback_is_error() {
        let codec = JsonCodec;
        assert!(matches!(
            codec.parse(b"{not json}\n", OnErrorFlags::DROP_MESSAGE),
            ParseOutcome::Error { .. }
        ));
    }
}
