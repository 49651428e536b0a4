//! Commit message trailer rewriting (pure)

use regex::Regex;
use std::sync::LazyLock;

/// `Reviewed-by` trailer name
pub const REVIEWED_BY: &str = "Reviewed-by";
/// `Tested-by` trailer name
pub const TESTED_BY: &str = "Tested-by";
/// `Part-of` trailer name
pub const PART_OF: &str = "Part-of";

static TRAILER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9-]+)\s*:\s*(\S?)").expect("trailer regex is valid")
});

/// Token of a `Token: value` line, if the line looks like a trailer
fn trailer_key(line: &str) -> Option<&str> {
    TRAILER_LINE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Replace all `trailer_name:` lines in `message` with one line per value.
///
/// Trailers go into the last paragraph. If that paragraph is not already a
/// trailer block, a new one is started. An empty `values` just strips the
/// existing trailer.
pub fn rewrite_trailers(message: &str, trailer_name: &str, values: &[String]) -> String {
    let kept: Vec<&str> = message
        .trim_end()
        .lines()
        .filter(|line| {
            !trailer_key(line).is_some_and(|key| key.eq_ignore_ascii_case(trailer_name))
        })
        .collect();
    let mut body = kept.join("\n").trim_end().to_string();

    if values.is_empty() {
        body.push('\n');
        return body;
    }

    if !ends_with_trailer_block(&body) {
        body.push('\n');
    }
    for value in values {
        body.push('\n');
        body.push_str(trailer_name);
        body.push_str(": ");
        body.push_str(value);
    }
    body.push('\n');
    body
}

/// The last paragraph consists only of `Token: value` lines
fn ends_with_trailer_block(body: &str) -> bool {
    let Some(last_paragraph) = body.rsplit("\n\n").next() else {
        return false;
    };
    // A subject line alone is never a trailer block
    if !body.contains("\n\n") {
        return false;
    }
    last_paragraph.lines().all(|line| {
        TRAILER_LINE
            .captures(line)
            .and_then(|c| c.get(2))
            .is_some_and(|value| !value.as_str().is_empty())
    })
}
