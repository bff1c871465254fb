//! On-error policy (§7), grounded on the original `OnError` bit flags
//! (`lib/on-error.c`): what a source does with a frame its parser
//! could not fully decode.

use bitflags::bitflags;

bitflags! {
    /// How a source reacts to a parse failure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OnErrorFlags: u8 {
        /// Drop the whole message.
        const DROP_MESSAGE = 0x01;
        /// Drop only the offending property/field, keep the rest.
        const DROP_PROPERTY = 0x02;
        /// Keep the message, degrading the offending value to its raw
        /// string form.
        const FALLBACK_TO_STRING = 0x04;
        /// Suppress the warning log line that would otherwise accompany
        /// the policy's action.
        const SILENT = 0x08;
    }
}

impl Default for OnErrorFlags {
    fn default() -> Self {
        OnErrorFlags::DROP_MESSAGE
    }
}

/// Parses the syslog-ng style `on-error()` value, e.g.
/// `"drop-message"`, `"silently-drop-property"`, `"fallback-to-string"`.
pub fn parse(value: &str) -> Option<OnErrorFlags> {
    let (silent, rest) = match value.strip_prefix("silently-") {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let mut flags = match rest {
        "drop-message" => OnErrorFlags::DROP_MESSAGE,
        "drop-property" => OnErrorFlags::DROP_PROPERTY,
        "fallback-to-string" => OnErrorFlags::FALLBACK_TO_STRING,
        _ => return None,
    };
    if silent {
        flags |= OnErrorFlags::SILENT;
    }
    Some(flags)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_and_silent_variants() {
        assert_eq!(parse("drop-message"), Some(OnErrorFlags::DROP_MESSAGE));
        assert_eq!(
            parse("silently-drop-property"),
            Some(OnErrorFlags::DROP_PROPERTY | OnErrorFlags::SILENT)
        );
        assert_eq!(parse("bogus"), None);
    }
}
