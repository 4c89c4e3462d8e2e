//! Lenient extraction of sub-fields from loosely structured MI payloads.
//!
//! Every field is optional here; callers supply the documented default. The
//! extractors never fail - a payload that does not match simply yields
//! nothing.

use once_cell::sync;
use regex::Regex;

use crate::mi::record::unescape;

static REASON_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
    Regex::new(r#"reason="((?:\\.|[^"\\])*)""#).expect("must compile")
});
static THREAD_ID_RE: sync::Lazy<Regex> =
    sync::Lazy::new(|| Regex::new(r#"thread-id="(\d+)""#).expect("must compile"));
static ID_RE: sync::Lazy<Regex> =
    sync::Lazy::new(|| Regex::new(r#"\bid="(\d+)""#).expect("must compile"));
static NUMBER_RE: sync::Lazy<Regex> =
    sync::Lazy::new(|| Regex::new(r#"number="(\d+)""#).expect("must compile"));
static VALUE_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
    Regex::new(r#"value="((?:\\.|[^"\\])*)""#).expect("must compile")
});
static LEVEL_RE: sync::Lazy<Regex> =
    sync::Lazy::new(|| Regex::new(r#"level="(\d+)""#).expect("must compile"));
static FUNC_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
    Regex::new(r#"func="((?:\\.|[^"\\])*)""#).expect("must compile")
});
static FULLNAME_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
    Regex::new(r#"fullname="((?:\\.|[^"\\])*)""#).expect("must compile")
});
static FILE_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
    Regex::new(r#"file="((?:\\.|[^"\\])*)""#).expect("must compile")
});
static LINE_RE: sync::Lazy<Regex> =
    sync::Lazy::new(|| Regex::new(r#"line="(\d+)""#).expect("must compile"));
static NAME_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
    Regex::new(r#"\{name="((?:\\.|[^"\\])*)""#).expect("must compile")
});

/// `reason="..."` of a `*stopped` payload.
pub fn stop_reason(payload: &str) -> Option<String> {
    REASON_RE.captures(payload).map(|c| unescape(&c[1]))
}

/// `thread-id="N"` of a `*stopped` payload.
pub fn thread_id(payload: &str) -> Option<i64> {
    THREAD_ID_RE
        .captures(payload)
        .and_then(|c| c[1].parse().ok())
}

/// `id="N"` of a thread lifecycle notification.
pub fn notify_thread_id(payload: &str) -> Option<i64> {
    ID_RE.captures(payload).and_then(|c| c[1].parse().ok())
}

/// First `number="N"`, the backend breakpoint id of a `-break-insert` result.
pub fn breakpoint_number(payload: &str) -> Option<u64> {
    NUMBER_RE.captures(payload).and_then(|c| c[1].parse().ok())
}

/// `value="..."` of a `-data-evaluate-expression` result.
pub fn value(payload: &str) -> Option<String> {
    VALUE_RE.captures(payload).map(|c| unescape(&c[1]))
}

/// One frame of a `-stack-list-frames` result. All fields optional.
#[derive(Debug, Clone, Default)]
pub struct FrameFields {
    pub level: Option<u32>,
    pub func: Option<String>,
    pub file: Option<String>,
    pub line: Option<i64>,
}

/// Scan `frame={...}` groups out of a `-stack-list-frames` result. The
/// sub-field regexes only see the text up to the next group because every
/// extractor takes the first match within its segment.
pub fn frames(payload: &str) -> Vec<FrameFields> {
    payload
        .split("frame={")
        .skip(1)
        .map(|segment| FrameFields {
            level: LEVEL_RE.captures(segment).and_then(|c| c[1].parse().ok()),
            func: FUNC_RE.captures(segment).map(|c| unescape(&c[1])),
            file: FULLNAME_RE
                .captures(segment)
                .or_else(|| FILE_RE.captures(segment))
                .map(|c| unescape(&c[1])),
            line: LINE_RE.captures(segment).and_then(|c| c[1].parse().ok()),
        })
        .collect()
}

/// One entry of a `-stack-list-variables --all-values` result.
#[derive(Debug, Clone)]
pub struct VarFields {
    pub name: String,
    pub value: Option<String>,
}

/// Scan name/value pairs out of a variable-list result. Valueless entries
/// are kept; the bridge reports them with a placeholder instead of dropping
/// them.
pub fn variables(payload: &str) -> Vec<VarFields> {
    let names: Vec<_> = NAME_RE.captures_iter(payload).collect();
    let mut out = Vec::with_capacity(names.len());
    for (idx, caps) in names.iter().enumerate() {
        let Some(whole) = caps.get(0) else { continue };
        let segment_end = names
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(payload.len());
        let segment = &payload[whole.end()..segment_end];
        out.push(VarFields {
            name: unescape(&caps[1]),
            value: VALUE_RE.captures(segment).map(|c| unescape(&c[1])),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOPPED: &str = r#"stopped,reason="breakpoint-hit",disp="keep",bkptno="1",thread-id="2",stopped-threads="all""#;

    #[test]
    fn stop_fields() {
        assert_eq!(stop_reason(STOPPED).as_deref(), Some("breakpoint-hit"));
        assert_eq!(thread_id(STOPPED), Some(2));
        assert_eq!(stop_reason("stopped"), None);
        assert_eq!(thread_id("stopped"), None);
    }

    #[test]
    fn breakpoint_number_from_insert_result() {
        let payload = r#"done,bkpt={number="2",type="breakpoint",disp="keep",enabled="y",addr="0x00401234",func="main",file="a.cpp",fullname="/tmp/a.cpp",line="10"}"#;
        assert_eq!(breakpoint_number(payload), Some(2));
        assert_eq!(breakpoint_number("done"), None);
    }

    #[test]
    fn value_from_evaluate_result() {
        assert_eq!(value(r#"done,value="4""#).as_deref(), Some("4"));
        assert_eq!(value("done"), None);
    }

    #[test]
    fn frames_from_stack_list() {
        let payload = r#"done,stack=[frame={level="0",addr="0x0001076c",func="callee4",file="basics.c",fullname="/home/foo/basics.c",line="8"},frame={level="1",addr="0x000107a4",func="main",file="basics.c",fullname="/home/foo/basics.c",line="32"}]"#;
        let frames = frames(payload);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].level, Some(0));
        assert_eq!(frames[0].func.as_deref(), Some("callee4"));
        assert_eq!(frames[0].file.as_deref(), Some("/home/foo/basics.c"));
        assert_eq!(frames[0].line, Some(8));
        assert_eq!(frames[1].func.as_deref(), Some("main"));
        assert_eq!(frames[1].line, Some(32));
    }

    #[test]
    fn frames_tolerate_missing_fields() {
        let payload = r#"done,stack=[frame={level="0",addr="0xdeadbeef"}]"#;
        let frames = frames(payload);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].func, None);
        assert_eq!(frames[0].file, None);
        assert_eq!(frames[0].line, None);
    }

    #[test]
    fn variables_with_and_without_values() {
        let payload = r#"done,variables=[{name="x",value="11"},{name="s",arg="1"},{name="big",value="{a = 1, b = 2}"}]"#;
        let vars = variables(payload);
        assert_eq!(vars.len(), 3);
        assert_eq!(vars[0].name, "x");
        assert_eq!(vars[0].value.as_deref(), Some("11"));
        assert_eq!(vars[1].name, "s");
        assert_eq!(vars[1].value, None);
        assert_eq!(vars[2].value.as_deref(), Some("{a = 1, b = 2}"));
    }

    #[test]
    fn variables_empty_payload() {
        assert!(variables("done,variables=[]").is_empty());
    }
}
