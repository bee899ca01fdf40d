//! Directive Extractor
//!
//! Splits a language-model reply into the prose meant for the user and at
//! most one embedded JSON mutation directive. The reply is untrusted input:
//! nothing in here fails a turn, a bad directive just means "text only".

pub mod scan;
pub mod validate;

use serde_json::Value;
use std::ops::Range;

pub use validate::{validate, validate_view_update, Directive, DirectiveAction, DirectiveError};

/// Reply used when removing the directive leaves no prose behind.
pub const ACKNOWLEDGEMENT: &str = "Done.";

/// Appended to the prose when the reply carried more than one directive.
pub const MULTIPLE_DIRECTIVES_NOTE: &str =
    "Note: the reply contained more than one change request; only the first one was considered.";

/// Result of scanning one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub human_text: String,
    pub directive: Option<Value>,
    /// Byte range of the directive inside the original reply.
    pub span: Option<Range<usize>>,
    /// Number of further JSON objects found after the first directive.
    pub extra_directives: usize,
}

impl Extraction {
    pub fn found(&self) -> bool {
        self.directive.is_some()
    }

    /// Soft advisory: more than one directive was present.
    pub fn has_multiple(&self) -> bool {
        self.extra_directives > 0
    }
}

/// Find the first balanced brace-delimited object that parses as a JSON
/// object. Brace spans that are not valid JSON (prose like `{name}`) are
/// left in the text and do not count as directives.
pub fn extract(text: &str) -> Extraction {
    let mut directive: Option<(Value, Range<usize>)> = None;
    let mut extra_directives = 0;

    for span in scan::balanced_objects(text) {
        let Ok(value) = serde_json::from_str::<Value>(&text[span.clone()]) else {
            continue;
        };
        if !value.is_object() {
            continue;
        }
        if directive.is_none() {
            directive = Some((value, span));
        } else {
            extra_directives += 1;
        }
    }

    match directive {
        Some((value, span)) => Extraction {
            human_text: split_text(text, span.clone()),
            directive: Some(value),
            span: Some(span),
            extra_directives,
        },
        None => Extraction {
            human_text: text.to_string(),
            directive: None,
            span: None,
            extra_directives: 0,
        },
    }
}

/// Remove `span` from `original`, drop leftover code-fence markers and
/// trim. Falls back to [`ACKNOWLEDGEMENT`] when nothing readable remains.
pub fn split_text(original: &str, span: Range<usize>) -> String {
    let start = char_boundary_at_or_before(original, span.start);
    let end = char_boundary_at_or_before(original, span.end.max(start));
    let (before, after) = unwrap_fence_pair(&original[..start], &original[end..]);
    let mut remainder = String::with_capacity(original.len() - (end - start));
    remainder.push_str(&before);
    remainder.push_str(&after);

    let cleaned = strip_code_fences(&remainder);
    if cleaned.is_empty() {
        ACKNOWLEDGEMENT.to_string()
    } else {
        cleaned
    }
}

/// Clamp `index` into `text` and move it back onto a UTF-8 boundary.
fn char_boundary_at_or_before(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Fence markers that wrapped the removed span, opener first. Longer
/// openers come before their prefixes.
const FENCE_PAIRS: [(&str, &str); 4] = [
    ("```json", "```"),
    ("```JSON", "```"),
    ("```", "```"),
    ("`", "`"),
];

/// Drop an opener ending `before` together with the matching closer
/// starting `after`. Line breaks around a block fence are kept; an inline
/// pair collapses to a single space between the surrounding words.
fn unwrap_fence_pair(before: &str, after: &str) -> (String, String) {
    let before_trimmed = before.trim_end();
    let after_trimmed = after.trim_start();
    for (open, close) in FENCE_PAIRS {
        let (Some(head), Some(tail)) = (
            before_trimmed.strip_suffix(open),
            after_trimmed.strip_prefix(close),
        ) else {
            continue;
        };
        let before_gap = &before[before_trimmed.len()..];
        let after_gap = &after[..after.len() - after_trimmed.len()];
        if before_gap.contains('\n') || after_gap.contains('\n') {
            return (
                format!("{}{}", head, before_gap),
                format!("{}{}", after_gap, tail),
            );
        }
        let head = head.trim_end();
        let tail = tail.trim_start();
        let separator = if head.is_empty() || tail.is_empty() { "" } else { " " };
        return (format!("{}{}", head, separator), tail.to_string());
    }
    (before.to_string(), after.to_string())
}

fn strip_code_fences(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            // Fence openers may carry a language tag (```json); drop the
            // whole marker but keep anything after a same-line closer.
            let rest = trimmed.trim_start_matches('`');
            let rest = rest
                .strip_prefix("json")
                .or_else(|| rest.strip_prefix("JSON"))
                .unwrap_or(rest)
                .trim();
            if !rest.is_empty() && !rest.chars().all(|c| c.is_ascii_alphanumeric()) {
                lines.push(rest);
            }
            continue;
        }
        lines.push(line.trim_end());
    }

    collapse_blank_lines(&lines).trim().to_string()
}

fn collapse_blank_lines(lines: &[&str]) -> String {
    let mut out = String::new();
    let mut previous_blank = false;
    for line in lines {
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
        previous_blank = blank;
    }
    out
}
