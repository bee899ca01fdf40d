//! Brace-balanced object scanning over free text.
//!
//! Quotes only matter once the scanner is inside an object: apostrophes and
//! stray quotes in the surrounding prose never toggle string mode.

use std::ops::Range;

/// Byte range of the balanced `{...}` object starting at `start`, if it
/// closes before the end of `text`.
pub fn balanced_object_at(text: &str, start: usize) -> Option<Range<usize>> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    // Every delimiter we track is ASCII, so byte scanning is UTF-8 safe.
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start..start + offset + 1);
                }
            }
            _ => {}
        }
    }

    None
}

/// All non-overlapping top-level balanced objects, in order of appearance.
/// An opening brace that never closes is skipped and scanning resumes just
/// after it, so a nested object inside an unterminated one is still found.
pub fn balanced_objects(text: &str) -> Vec<Range<usize>> {
    let mut found = Vec::new();
    let mut cursor = 0;

    while let Some(relative) = text[cursor..].find('{') {
        let start = cursor + relative;
        match balanced_object_at(text, start) {
            Some(span) => {
                cursor = span.end;
                found.push(span);
            }
            None => cursor = start + 1,
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(text: &str) -> Vec<&str> {
        balanced_objects(text)
            .into_iter()
            .map(|span| &text[span])
            .collect()
    }

    #[test]
    fn finds_single_object_in_prose() {
        assert_eq!(spans(r#"Sure! {"a":1} done"#), vec![r#"{"a":1}"#]);
    }

    #[test]
    fn braces_inside_strings_do_not_nest() {
        let text = r#"x {"label":"a } b { c","n":{"m":2}} y"#;
        assert_eq!(spans(text), vec![r#"{"label":"a } b { c","n":{"m":2}}"#]);
    }

    #[test]
    fn escaped_quotes_stay_inside_string() {
        let text = r#"{"text":"say \"}\" now"}"#;
        assert_eq!(spans(text), vec![text]);
    }

    #[test]
    fn apostrophes_in_prose_are_ignored() {
        let text = r#"Here's one: {"a":"it's"} and that's it"#;
        assert_eq!(spans(text), vec![r#"{"a":"it's"}"#]);
    }

    #[test]
    fn multiple_top_level_objects_are_all_reported() {
        assert_eq!(spans(r#"{"a":1} and {"b":2}"#), vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn unterminated_outer_brace_still_exposes_inner_object() {
        assert_eq!(spans(r#"oops { then {"a":1}"#), vec![r#"{"a":1}"#]);
    }

    #[test]
    fn no_braces_means_no_objects() {
        assert!(balanced_objects("plain text, nothing to see").is_empty());
        assert!(balanced_objects("} stray closer").is_empty());
    }

    #[test]
    fn multibyte_text_is_handled() {
        assert_eq!(spans("héllo ✓ {\"ok\":\"日本\"} ✓"), vec!["{\"ok\":\"日本\"}"]);
    }
}
