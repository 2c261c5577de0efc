//! Framing and parsing of raw REPL responses.
//!
//! A plain raw REPL execution answers with
//!
//! ```text
//! OK<output>\x04<error>\x04>
//! ```
//!
//! Raw-paste executions answer the same way without the `OK` prefix, after
//! the device has acknowledged the end of the code with its own `\x04`.

use super::{END_OF_DATA, NORMAL_PROMPT, OK_PREFIX, RAW_BANNER, RAW_PROMPT};
use crate::{Error, Result};

/// Output and error text split out of a raw REPL response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    /// Everything before the first terminator, trailing line endings removed.
    pub output: String,
    /// Traceback text between the first and second terminator, if any.
    pub error: Option<String>,
}

/// Parse a plain raw REPL response, which must start with `OK`.
pub fn parse_response(raw: &[u8]) -> Result<RawResponse> {
    let body = raw
        .strip_prefix(OK_PREFIX)
        .ok_or_else(|| Error::parse("missing OK prefix", raw))?;
    parse_body(body)
}

/// Parse a response body (the part after `OK`, or after the raw-paste ack).
///
/// The output ends at the *first* terminator. When there is no terminator
/// but the text ends in the raw prompt, only that prompt is stripped.
pub fn parse_body(body: &[u8]) -> Result<RawResponse> {
    let (output, error) = match position(body, END_OF_DATA) {
        Some(first) => {
            let rest = &body[first + 1..];
            let error = match position(rest, END_OF_DATA) {
                Some(second) => &rest[..second],
                None => rest.strip_suffix(&[RAW_PROMPT]).unwrap_or(rest),
            };
            (&body[..first], error)
        }
        None => match body.strip_suffix(&[RAW_PROMPT]) {
            Some(output) => (output, &[][..]),
            None => return Err(Error::parse("no terminator or prompt", body)),
        },
    };

    let output = String::from_utf8_lossy(output)
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .to_string();
    let error = String::from_utf8_lossy(error).trim().to_string();

    Ok(RawResponse {
        output,
        error: (!error.is_empty()).then_some(error),
    })
}

/// End of the raw mode banner (`raw REPL; CTRL-B to exit\r\n>`).
pub(crate) fn raw_banner_end(buf: &[u8]) -> Option<usize> {
    let start = find(buf, RAW_BANNER)?;
    let after = start + RAW_BANNER.len();
    position(&buf[after..], RAW_PROMPT).map(|p| after + p + 1)
}

/// End of the normal REPL prompt (`>>> `).
pub(crate) fn normal_prompt_end(buf: &[u8]) -> Option<usize> {
    find(buf, NORMAL_PROMPT).map(|p| p + NORMAL_PROMPT.len())
}

/// End of a complete response body: two terminators then the raw prompt.
pub(crate) fn response_end(buf: &[u8]) -> Option<usize> {
    let first = position(buf, END_OF_DATA)?;
    let second = first + 1 + position(&buf[first + 1..], END_OF_DATA)?;
    let prompt = second + 1 + position(&buf[second + 1..], RAW_PROMPT)?;
    Some(prompt + 1)
}

/// Whether `buf` is a response that ended on the raw prompt with no
/// terminator at all. Only trusted once the response timeout expires.
pub(crate) fn is_unterminated_response(buf: &[u8], expect_ok: bool) -> bool {
    let body = if expect_ok {
        match buf.strip_prefix(OK_PREFIX) {
            Some(body) => body,
            None => return false,
        }
    } else {
        buf
    };
    position(body, END_OF_DATA).is_none() && body.last() == Some(&RAW_PROMPT)
}

pub(crate) fn position(haystack: &[u8], byte: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == byte)
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn output_before_first_terminator() {
        let parsed = parse_response(b"OKtest1\r\n\x04\x04>").unwrap();
        assert_eq!(parsed.output, "test1");
        assert_eq!(parsed.error, None);
    }

    #[test]
    fn empty_output() {
        let parsed = parse_response(b"OK\x04\x04>").unwrap();
        assert_eq!(parsed.output, "");
        assert_eq!(parsed.error, None);
    }

    #[test]
    fn numeric_output() {
        let parsed = parse_response(b"OK4\r\n\x04\x04>").unwrap();
        assert_eq!(parsed.output, "4");
    }

    #[test]
    fn error_between_terminators() {
        let raw = b"OK\x04Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nZeroDivisionError: divide by zero\r\n\x04>";
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.output, "");
        let error = parsed.error.unwrap();
        assert!(error.starts_with("Traceback"));
        assert!(error.ends_with("ZeroDivisionError: divide by zero"));
    }

    #[test]
    fn traceback_never_leaks_into_output() {
        let parsed = parse_response(b"OKpartial\r\n\x04NameError: x\r\n\x04>").unwrap();
        assert_eq!(parsed.output, "partial");
        assert_eq!(parsed.error.as_deref(), Some("NameError: x"));
    }

    #[test]
    fn interior_whitespace_kept() {
        let parsed = parse_response(b"OK  a  \r\n  b\r\n\x04\x04>").unwrap();
        assert_eq!(parsed.output, "  a  \r\n  b");
    }

    #[test]
    fn prompt_without_terminator() {
        let parsed = parse_response(b"OKhello\r\n>").unwrap();
        assert_eq!(parsed.output, "hello");
        assert_eq!(parsed.error, None);
    }

    #[test]
    fn missing_ok_is_fault() {
        let err = parse_response(b"raw REPL; CTRL-B to exit\r\n>").unwrap_err();
        assert!(err.is_protocol_fault());
    }

    #[test]
    fn incomplete_body_is_fault() {
        assert!(parse_response(b"OKhal").unwrap_err().is_protocol_fault());
    }

    #[test]
    fn paste_body_has_no_ok() {
        let parsed = parse_body(b"4\r\n\x04\x04>").unwrap();
        assert_eq!(parsed.output, "4");
    }

    #[test]
    fn frame_ends() {
        assert_eq!(raw_banner_end(b"\r\nraw REPL; CTRL-B to exit\r\n>rest"), Some(29));
        assert_eq!(raw_banner_end(b"raw REPL; CTRL-B to exit\r\n"), None);
        assert_eq!(normal_prompt_end(b"MicroPython\r\n>>> "), Some(17));
        assert_eq!(response_end(b"OK1\x04\x04>"), Some(6));
        assert_eq!(response_end(b"OK1\x04\x04"), None);
        assert_eq!(response_end(b"OK1\x04err\x04>>>"), Some(9));
    }

    #[test]
    fn unterminated_detection() {
        assert!(is_unterminated_response(b"OKhi\r\n>", true));
        assert!(!is_unterminated_response(b"OKhi\x04\x04>", true));
        assert!(!is_unterminated_response(b"hi>", true));
        assert!(is_unterminated_response(b"hi>", false));
    }

    proptest! {
        #[test]
        fn output_and_error_are_exact(
            out in "[a-zA-Z0-9 ]{0,40}",
            err in "[a-zA-Z0-9:]{0,40}",
            tail in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let mut raw = b"OK".to_vec();
            raw.extend_from_slice(out.as_bytes());
            raw.push(END_OF_DATA);
            raw.extend_from_slice(err.as_bytes());
            raw.push(END_OF_DATA);
            raw.push(RAW_PROMPT);
            raw.extend_from_slice(&tail);

            let parsed = parse_response(&raw).unwrap();
            prop_assert_eq!(parsed.output, out.trim_end_matches(|c| c == '\r' || c == '\n'));
            let expected_err = err.trim();
            prop_assert_eq!(parsed.error.as_deref(), (!expected_err.is_empty()).then_some(expected_err));
        }
    }
}
