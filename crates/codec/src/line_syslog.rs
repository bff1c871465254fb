//! RFC3164-style line syslog: `<PRI>TIMESTAMP HOST PROGRAM[PID]: MSG`.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use chrono::{Datelike, Local, NaiveDateTime, TimeZone};
use event::{Event, EventMeta, Value};

use crate::{Codec, CodecError, OnErrorFlags, ParseOutcome};

/// Codec for the classic BSD ("RFC3164-ish") line format.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineSyslogCodec;

fn find_newline(input: &[u8]) -> Option<usize> {
    input.iter().position(|&b| b == b'\n')
}

fn parse_line(line: &str) -> Result<Event, String> {
    let line = line.trim_end_matches('\r');
    let rest = line
        .strip_prefix('<')
        .ok_or_else(|| "missing PRI start".to_string())?;
    let (pri_str, rest) = rest
        .split_once('>')
        .ok_or_else(|| "missing PRI terminator".to_string())?;
    let pri: u8 = pri_str.parse().map_err(|_| "non-numeric PRI".to_string())?;
    let facility = pri >> 3;
    let severity = pri & 0x07;

    let mut tokens = rest.splitn(4, ' ').filter(|t| !t.is_empty());
    let month = tokens.next().ok_or("missing month")?;
    let day = tokens.next().ok_or("missing day")?;
    let time = tokens.next().ok_or("missing time")?;
    let remainder = tokens.next().ok_or("missing host/program/message")?;
    let timestamp_str = format!("{month} {day} {time}");

    let mut remainder_tokens = remainder.splitn(2, ' ');
    let host = remainder_tokens.next().ok_or("missing host")?;
    let tail = remainder_tokens.next().ok_or("missing program/message")?;

    let (program_tag, msg) = tail
        .split_once(": ")
        .or_else(|| tail.split_once(':'))
        .ok_or("missing ':' after program tag")?;

    let (program, pid) = match program_tag.split_once('[') {
        Some((p, rest)) => {
            let pid_str = rest.trim_end_matches(']');
            (p, pid_str.parse::<i32>().ok())
        }
        None => (program_tag, None),
    };

    let now_year = Local::now().year();
    let naive = NaiveDateTime::parse_from_str(
        &format!("{now_year} {timestamp_str}"),
        "%Y %b %e %H:%M:%S",
    )
    .map_err(|e| format!("bad timestamp: {e}"))?;
    let timestamp_nanos = Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_nanos_opt().unwrap_or(0))
        .unwrap_or(0);

    let mut event = Event::new(EventMeta {
        timestamp: Some(timestamp_nanos),
        host: Some(Arc::from(host)),
        program: Some(Arc::from(program)),
        pid,
        severity: Some(severity),
        facility: Some(facility),
        raw_message: Some(bytes::Bytes::copy_from_slice(line.as_bytes())),
    });
    event
        .set("message", Value::String(Arc::from(msg.trim_start())))
        .expect("freshly created event is exclusively owned");
    Ok(event)
}

impl Codec for LineSyslogCodec {
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
        match parse_line(line) {
            Ok(event) => ParseOutcome::Parsed { event, consumed },
            Err(reason) => {
                if on_error.contains(OnErrorFlags::FALLBACK_TO_STRING) {
                    let mut event = Event::new(EventMeta {
                        raw_message: Some(bytes::Bytes::copy_from_slice(line.as_bytes())),
                        ..Default::default()
                    });
                    event
                        .set("message", Value::String(Arc::from(line)))
                        .expect("exclusively owned");
                    event
                        .set(".error", Value::String(Arc::from(reason.as_str())))
                        .expect("exclusively owned");
                    ParseOutcome::Parsed { event, consumed }
                } else {
                    ParseOutcome::Error {
                        error: CodecError::Malformed(reason),
                        consumed,
                    }
                }
            }
        }
    }

    fn format(&self, event: &Event, out: &mut BytesMut) -> usize {
        let start = out.len();
        let facility = event.meta().facility.unwrap_or(1);
        let severity = event.meta().severity.unwrap_or(6);
        let pri = (facility << 3) | severity;
        out.put_slice(format!("<{pri}>").as_bytes());
        let ts = event
            .meta()
            .timestamp
            .and_then(|nanos| chrono::DateTime::from_timestamp(nanos / 1_000_000_000, 0))
            .unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).expect("epoch is valid"));
        out.put_slice(ts.format("%b %e %H:%M:%S").to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(event.meta().host.as_deref().unwrap_or("-").as_bytes());
        out.put_u8(b' ');
        out.put_slice(event.meta().program.as_deref().unwrap_or("-").as_bytes());
        if let Some(pid) = event.meta().pid {
            out.put_slice(format!("[{pid}]").as_bytes());
        }
        out.put_slice(b": ");
        if let Some(Value::String(msg)) = event.get("message") {
            out.put_slice(msg.as_bytes());
        }
        out.len() - start
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_happy_path_line() {
        let codec = LineSyslogCodec;
        let input = b"<38>Jan 1 00:00:01 h p: a\n";
        match codec.parse(input, OnErrorFlags::default()) {
            ParseOutcome::Parsed { event, consumed } => {
                assert_eq!(consumed, input.len());
                assert_eq!(event.meta().host.as_deref(), Some("h"));
                assert_eq!(event.meta().program.as_deref(), Some("p"));
                assert_eq!(event.meta().severity, Some(6));
                assert_eq!(event.meta().facility, Some(4));
                assert_eq!(event.get("message"), Some(&Value::String(Arc::from("a"))));
            }
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn need_more_without_newline() {
        let codec = LineSyslogCodec;
        assert!(matches!(
            codec.parse(b"<38>partial", OnErrorFlags::default()),
            ParseOutcome::NeedMore
        ));
    }

    #[test]
    fn malformed_without_fallback_reports_error() {
        let codec = LineSyslogCodec;
        let input = b"not a syslog line at all\n";
        assert!(matches!(
            codec.parse(input, OnErrorFlags::DROP_MESSAGE),
            ParseOutcome::Error { .. }
        ));
    }

    #[test]
    fn malformed_with_fallback_produces_degraded_event() {
        let codec = LineSyslogCodec;
        let input = b"not a syslog line at all\n";
        match codec.parse(input, OnErrorFlags::FALLBACK_TO_STRING) {
            ParseOutcome::Parsed { event, .. } => {
                assert!(event.get(".error").is_some());
            }
            _ => panic!("expected a degraded Parsed event"),
        }
    }
}
