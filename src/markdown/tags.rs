use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::code::is_code_region;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$(.+?)\$").unwrap());

/// Read `$tag$` markers from the last line of the body.
///
/// The body is normalized first (CRLF to LF, trailing whitespace removed). If
/// the last line holds at least one tag it is dropped whole; otherwise the
/// normalized body is returned as is. A last line inside code is never read.
pub fn extract_tags(body: &str) -> (Vec<String>, String) {
    if body.is_empty() {
        return (Vec::new(), body.to_string());
    }

    let body = body.replace("\r\n", "\n");
    let body = body.trim_end();
    let (head, last) = match body.rfind('\n') {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => ("", body),
    };

    let last = last.trim();
    let position = body.len() - last.len();
    if is_code_region(body, position) {
        debug!("last line is inside code, no tags read");
        return (Vec::new(), body.to_string());
    }

    let tags: Vec<String> = TAG_RE
        .captures_iter(last)
        .map(|caps| caps[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if tags.is_empty() {
        return (tags, body.to_string());
    }

    debug!(?tags, "tags read from last line");
    (tags, head.trim_end().to_string())
}
