//! RFC5424 syslog with optional structured data:
//! `<PRI>1 TIMESTAMP HOST APP-NAME PROCID MSGID STRUCTURED-DATA MSG`.
//!
//! Structured-data parse failures are the codec's main `on-error`
//! surface (§7, §8 scenario S4): under `drop-property` the event is
//! still emitted, minus the offending structured-data fields, tagged
//! with a `.error` field; under `drop-message` the whole frame is
//! reported as an error instead.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use event::{Event, EventMeta, Value};
use indexmap::IndexMap;

use crate::{Codec, CodecError, OnErrorFlags, ParseOutcome};

/// Codec for RFC5424 framing with structured data.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rfc5424Codec;

fn find_newline(input: &[u8]) -> Option<usize> {
    input.iter().position(|&b| b == b'\n')
}

/// Parses the `STRUCTURED-DATA` element(s) into a mapping, returning
/// `Err` with a human-readable reason on malformed bracket syntax.
fn parse_structured_data(sd: &str) -> Result<IndexMap<Arc<str>, Value>, String> {
    let mut out = IndexMap::new();
    if sd == "-" {
        return Ok(out);
    }
    let mut rest = sd;
    while !rest.is_empty() {
        let rest_trimmed = rest
            .strip_prefix('[')
            .ok_or_else(|| "structured-data element missing '['".to_string())?;
        let end = rest_trimmed
            .find(']')
            .ok_or_else(|| "structured-data element missing ']'".to_string())?;
        let body = &rest_trimmed[..end];
        let (id, params) = body.split_once(' ').unwrap_or((body, ""));
        let mut element = IndexMap::new();
        for pair in params.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("malformed param '{pair}' in element '{id}'"))?;
            let value = value.trim_matches('"');
            let _ = element.insert(Arc::from(key), Value::String(Arc::from(value)));
        }
        let _ = out.insert(Arc::from(id), Value::Mapping(Arc::new(element)));
        rest = &rest_trimmed[end + 1..];
    }
    Ok(out)
}

fn parse_line(line: &str, on_error: OnErrorFlags) -> Result<Event, String> {
    let rest = line.strip_prefix('<').ok_or("missing PRI start")?;
    let (pri_str, rest) = rest.split_once('>').ok_or("missing PRI terminator")?;
    let pri: u8 = pri_str.parse().map_err(|_| "non-numeric PRI".to_string())?;
    let facility = pri >> 3;
    let severity = pri & 0x07;

    let mut tokens = rest.splitn(7, ' ');
    let version = tokens.next().ok_or("missing version")?;
    if version != "1" {
        return Err(format!("unsupported version '{version}'"));
    }
    let timestamp = tokens.next().ok_or("missing timestamp")?;
    let host = tokens.next().ok_or("missing hostname")?;
    let app_name = tokens.next().ok_or("missing app-name")?;
    let proc_id = tokens.next().ok_or("missing procid")?;
    let _msg_id = tokens.next().ok_or("missing msgid")?;
    let sd_and_msg = tokens.next().ok_or("missing structured-data")?;

    let (sd, msg): (String, &str) = if let Some(rest) = sd_and_msg.strip_prefix('-') {
        ("-".to_string(), rest.trim_start())
    } else {
        match sd_and_msg.split_once(']') {
            Some((head, tail)) => (format!("{head}]"), tail.trim_start()),
            None => return Err("unterminated structured-data".to_string()),
        }
    };

    let mut event = Event::new(EventMeta {
        timestamp: if timestamp == "-" {
            None
        } else {
            Some(0)
        },
        host: Some(Arc::from(host)),
        program: Some(Arc::from(app_name)),
        pid: proc_id.parse().ok(),
        severity: Some(severity),
        facility: Some(facility),
        raw_message: Some(bytes::Bytes::copy_from_slice(line.as_bytes())),
    });
    event
        .set("message", Value::String(Arc::from(msg)))
        .expect("exclusively owned");

    match parse_structured_data(&sd) {
        Ok(fields) => {
            for (k, v) in fields {
                event.set(k, v).expect("exclusively owned");
            }
        }
        Err(reason) => {
            if on_error.contains(OnErrorFlags::DROP_PROPERTY)
                || on_error.contains(OnErrorFlags::FALLBACK_TO_STRING)
            {
                event
                    .set(".error", Value::String(Arc::from(reason.as_str())))
                    .expect("exclusively owned");
            } else {
                return Err(reason);
            }
        }
    }
    Ok(event)
}

impl Codec for Rfc5424Codec {
    fn parse(&self, input: &[u8], on_error: OnErrorFlags) -> ParseOutcome {
        let newline = match find_newline(input) {
            Some(pos) => pos,
            None => return ParseOutcome::NeedMore,
        };
        let consumed = newline + 1;
        let line = match std::str::from_utf8(&input[..newline]) {
            Ok(s) => s,
            Err(e) => {
                return ParseOutcome::Error {
                    error: CodecError::Malformed(e.to_string()),
                    consumed,
                }
            }
        };
        match parse_line(line, on_error) {
            Ok(event) => ParseOutcome::Parsed { event, consumed },
            Err(reason) => ParseOutcome::Error {
                error: CodecError::Malformed(reason),
                consumed,
            },
        }
    }

    fn format(&self, event: &Event, out: &mut BytesMut) -> usize {
        let start = out.len();
        let facility = event.meta().facility.unwrap_or(1);
        let severity = event.meta().severity.unwrap_or(6);
        let pri = (facility << 3) | severity;
        out.put_slice(format!("<{pri}>1 ").as_bytes());
        out.put_slice(b"- ");
        out.put_slice(event.meta().host.as_deref().unwrap_or("-").as_bytes());
        out.put_u8(b' ');
        out.put_slice(event.meta().program.as_deref().unwrap_or("-").as_bytes());
        out.put_u8(b' ');
        match event.meta().pid {
            Some(pid) => out.put_slice(pid.to_string().as_bytes()),
            None => out.put_u8(b'-'),
        }
        out.put_slice(b" - - ");
        if let Some(Value::String(msg)) = event.get("message") {
            out.put_slice(msg.as_bytes());
        }
        out.len() - start
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(line: &str, on_error: OnErrorFlags) -> ParseOutcome {
        let codec = Rfc5424Codec;
        let mut buf = line.as_bytes().to_vec();
        buf.push(b'\n');
        codec.parse(&buf, on_error)
    }

    #[test]
    fn parses_with_valid_structured_data() {
        match parse(
            r#"<165>1 2003-10-11T22:14:15.003Z h app 1234 ID1 [ex@32473 iut="3"] msg body"#,
            OnErrorFlags::default(),
        ) {
            ParseOutcome::Parsed { event, .. } => {
                assert_eq!(event.meta().host.as_deref(), Some("h"));
                assert_eq!(event.get("message"), Some(&Value::String(Arc::from("msg body"))));
                assert!(event.get("ex@32473").is_some());
            }
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn drop_property_keeps_event_without_failing_field() {
        match parse(
            r#"<165>1 - h app 1234 ID1 [ex@32473 broken] msg body"#,
            OnErrorFlags::DROP_PROPERTY,
        ) {
            ParseOutcome::Parsed { event, .. } => {
                assert!(event.get(".error").is_some());
                assert!(event.get("ex@32473").is_none());
            }
            _ => panic!("expected a degraded Parsed event under drop-property"),
        }
    }

    #[test]
    fn drop_message_reports_error_on_malformed_structured_data() {
        match parse(
            r#"<165>1 - h app 1234 ID1 [ex@32473 broken] msg body"#,
            OnErrorFlags::DROP_MESSAGE,
        ) {
            ParseOutcome::Error { .. } => {}
            _ => panic!("expected Error under drop-message"),
        }
    }
}
