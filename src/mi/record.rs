//! Classification of a single MI output line into a typed record.
//!
//! The grammar is `^(\d+)?([\^*=~&@])(.*)$`: an optional decimal token,
//! exactly one sigil, then the payload. Lines outside the grammar (the
//! `(gdb)` prompt aside, gdb sometimes prints plain text) degrade to console
//! stream records instead of failing - malformed backend output must never
//! crash the bridge.

use once_cell::sync;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `^` - the only kind that can satisfy a pending command.
    Result,
    /// `*` - asynchronous execution status (stop notifications).
    ExecAsync,
    /// `=` - general notifications (thread lifecycle and friends).
    Notify,
    /// `~` - console stream text.
    Console,
    /// `&` - log stream text.
    Log,
    /// `@` - target program stream text.
    Target,
}

impl RecordKind {
    pub fn is_stream(self) -> bool {
        matches!(self, RecordKind::Console | RecordKind::Log | RecordKind::Target)
    }
}

/// One classified MI output line.
#[derive(Debug, Clone)]
pub struct Record {
    pub token: Option<u64>,
    pub kind: RecordKind,
    pub payload: String,
}

impl Record {
    /// Parse a raw line. Total: never fails, falls back to console text.
    pub fn classify(line: &str) -> Record {
        static LINE_RE: sync::Lazy<Regex> =
            sync::Lazy::new(|| Regex::new(r"^(\d+)?([\^*=~&@])(.*)$").expect("must compile"));

        if let Some(caps) = LINE_RE.captures(line) {
            let kind = match &caps[2] {
                "^" => RecordKind::Result,
                "*" => RecordKind::ExecAsync,
                "=" => RecordKind::Notify,
                "~" => RecordKind::Console,
                "&" => RecordKind::Log,
                "@" => RecordKind::Target,
                _ => return Record::console(line),
            };
            return Record {
                token: caps.get(1).and_then(|m| m.as_str().parse().ok()),
                kind,
                payload: caps[3].to_string(),
            };
        }

        Record::console(line)
    }

    /// A synthetic console record, used for the passthrough fallback and for
    /// connection-level diagnostics.
    pub fn console(text: &str) -> Record {
        Record {
            token: None,
            kind: RecordKind::Console,
            payload: text.to_string(),
        }
    }
}

/// Extract the `msg="..."` field of an `error` result payload, falling back
/// to the whole payload when the field is absent.
pub fn error_message(payload: &str) -> String {
    static MSG_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
        Regex::new(r#"msg="((?:\\.|[^"\\])*)""#).expect("must compile")
    });

    match MSG_RE.captures(payload) {
        Some(caps) => unescape(&caps[1]),
        None => payload.to_string(),
    }
}

/// Decode the text carried by a stream record.
///
/// Stage one decodes the double-quoted MI literal (its `\n`, `\"`, `\\` and
/// `\NNN` escapes). Stage two reinterprets any *residual* `\NNN` octal
/// escapes as raw byte values and re-decodes the byte sequence as UTF-8: gdb
/// can emit multi-byte text double-encoded through its escaping layer, and a
/// single unescape pass corrupts non-ASCII output. Pure-ASCII payloads
/// without escapes round-trip untouched.
pub fn decode_stream_text(payload: &str) -> String {
    let inner = match payload
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => inner,
        // Not a quoted literal, pass through verbatim.
        None => return payload.to_string(),
    };
    decode_octal_bytes(&unescape(inner))
}

/// Decode MI string escapes into text. Octal escapes become single bytes,
/// the result is re-assembled as (lossy) UTF-8.
pub(crate) fn unescape(escaped: &str) -> String {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            push_char(&mut bytes, c);
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('r') => bytes.push(b'\r'),
            Some('t') => bytes.push(b'\t'),
            Some('"') => bytes.push(b'"'),
            Some('\\') => bytes.push(b'\\'),
            Some(d @ '0'..='7') => {
                let mut value = d as u32 - '0' as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(&n @ '0'..='7') => {
                            value = value * 8 + (n as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            // Unknown escape: keep it as-is.
            Some(other) => {
                bytes.push(b'\\');
                push_char(&mut bytes, other);
            }
            None => bytes.push(b'\\'),
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

/// Second unescape stage: `\NNN` sequences that survived the first stage are
/// raw byte values of a UTF-8 encoding.
fn decode_octal_bytes(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }

    let mut bytes = Vec::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            push_char(&mut bytes, c);
            continue;
        }
        match chars.peek() {
            Some('0'..='7') => {
                let mut value = 0u32;
                for _ in 0..3 {
                    match chars.peek() {
                        Some(&n @ '0'..='7') => {
                            value = value * 8 + (n as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            _ => bytes.push(b'\\'),
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_result_with_token() {
        let rec = Record::classify("3^done,value=\"4\"");
        assert_eq!(rec.token, Some(3));
        assert_eq!(rec.kind, RecordKind::Result);
        assert_eq!(rec.payload, "done,value=\"4\"");
    }

    #[test]
    fn classify_tokenless_records() {
        let rec = Record::classify("*stopped,reason=\"breakpoint-hit\"");
        assert_eq!(rec.token, None);
        assert_eq!(rec.kind, RecordKind::ExecAsync);

        let rec = Record::classify("=thread-created,id=\"1\"");
        assert_eq!(rec.kind, RecordKind::Notify);

        let rec = Record::classify("~\"hello\"");
        assert_eq!(rec.kind, RecordKind::Console);
        let rec = Record::classify("&\"warning\"");
        assert_eq!(rec.kind, RecordKind::Log);
        let rec = Record::classify("@\"target out\"");
        assert_eq!(rec.kind, RecordKind::Target);
        assert!(rec.kind.is_stream());
    }

    #[test]
    fn classify_malformed_line_degrades_to_console() {
        let rec = Record::classify("(gdb) ");
        assert_eq!(rec.kind, RecordKind::Console);
        assert_eq!(rec.payload, "(gdb) ");
        assert_eq!(rec.token, None);

        let rec = Record::classify("Reading symbols from /tmp/a.out...");
        assert_eq!(rec.kind, RecordKind::Console);
    }

    #[test]
    fn error_message_extraction() {
        let payload = r#"error,msg="No symbol \"x\" in current context.""#;
        assert_eq!(
            error_message(payload),
            r#"No symbol "x" in current context."#
        );
    }

    #[test]
    fn error_message_falls_back_to_payload() {
        assert_eq!(error_message("error"), "error");
    }

    #[test]
    fn ascii_stream_text_is_identity() {
        assert_eq!(decode_stream_text("\"hello world\""), "hello world");
    }

    #[test]
    fn stream_text_simple_escapes() {
        assert_eq!(decode_stream_text(r#""line\n""#), "line\n");
        assert_eq!(decode_stream_text(r#""quo\"ted""#), "quo\"ted");
    }

    #[test]
    fn stream_text_single_encoded_octal() {
        // e-acute, UTF-8 0xC3 0xA9, escaped once by gdb.
        assert_eq!(decode_stream_text(r#""caf\303\251""#), "café");
    }

    #[test]
    fn stream_text_double_encoded_octal() {
        // The same bytes escaped twice: stage one yields the literal text
        // `\303\251`, stage two recovers the character.
        assert_eq!(decode_stream_text(r#""caf\\303\\251""#), "café");
    }

    #[test]
    fn unquoted_payload_passes_through() {
        assert_eq!(decode_stream_text("not quoted"), "not quoted");
    }
}
