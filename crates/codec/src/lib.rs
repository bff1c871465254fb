#![deny(unsafe_code)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Parser/formatter interface (§6) between transport bytes and
//! [`event::Event`]s: `parse(bytes, event) -> {ok, need-more, error}`,
//! `format(event, buf) -> bytes_written`.

mod json;
mod line_syslog;
mod on_error;
mod rfc5424;

pub use json::JsonCodec;
pub use line_syslog::LineSyslogCodec;
pub use on_error::{parse as parse_on_error, OnErrorFlags};
pub use rfc5424::Rfc5424Codec;

use bytes::BytesMut;
use event::Event;
use thiserror::Error;

/// A parse/format failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input could not be interpreted under this codec's grammar.
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Result of attempting to parse one frame.
pub enum ParseOutcome {
    /// A complete event was parsed; `consumed` is how many leading
    /// bytes of the input it accounted for.
    Parsed {
        /// The parsed event.
        event: Event,
        /// Number of leading bytes of the input consumed.
        consumed: usize,
    },
    /// The input contains a partial frame; the caller should read more
    /// bytes and retry.
    NeedMore,
    /// The input was malformed. `consumed` bytes (if any, e.g. up to a
    /// line delimiter) should still be skipped so the stream does not
    /// stall; the caller applies its `on-error` policy to decide
    /// whether to recover a degraded event or drop entirely.
    Error {
        /// The failure.
        error: CodecError,
        /// Bytes to skip before the next parse attempt.
        consumed: usize,
    },
}

/// Converts transport bytes to/from events.
pub trait Codec: Send + Sync {
    /// Attempts to parse one frame from the front of `input`.
    fn parse(&self, input: &[u8], on_error: OnErrorFlags) -> ParseOutcome;

    /// Serialises `event` into `out`, returning the number of bytes
    /// written.
    fn format(&self, event: &Event, out: &mut BytesMut) -> usize;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn on_error_default_is_drop_message() {
        assert_eq!(OnErrorFlags::default(), OnErrorFlags::DROP_MESSAGE);
    }
}
