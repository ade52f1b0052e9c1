//! Locating a JSON payload inside free-form model text.
//!
//! Models wrap their answer in prose, markdown fences, or both. These
//! helpers find the regions worth handing to the JSON decoder, best first.

/// Every fenced code block, in order of appearance.
///
/// Returns `(language_hint, content)`; the hint is `None` for bare fences.
/// An opening fence without a closing one is ignored.
///
/// # Examples
///
/// ```
/// use llm_runnables::output_parser::extract::fenced_blocks;
///
/// let text = "Sure:\n```json\n{\"a\": 1}\n```\nand\n```\nplain\n```";
/// let blocks = fenced_blocks(text);
/// assert_eq!(blocks, vec![(Some("json"), "{\"a\": 1}"), (None, "plain")]);
/// ```
pub fn fenced_blocks(text: &str) -> Vec<(Option<&str>, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(line_end) = after.find('\n') else {
            break;
        };
        let hint = after[..line_end].trim();
        let body = &after[line_end + 1..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push((
            if hint.is_empty() { None } else { Some(hint) },
            body[..close].trim(),
        ));
        rest = &body[close + 3..];
    }
    blocks
}

/// The last top-level `{...}` region whose braces balance.
///
/// Braces inside JSON strings are ignored. Later regions win because models
/// tend to restate or correct themselves before the final answer.
pub fn last_balanced_object(text: &str) -> Option<&str> {
    last_balanced(text, '{', '}')
}

/// The last top-level `[...]` region whose brackets balance.
pub fn last_balanced_array(text: &str) -> Option<&str> {
    last_balanced(text, '[', ']')
}

fn last_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let mut best = None;
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            c if c == open => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            c if c == close && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    best = Some(&text[start..i + close.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    best
}

/// From the first `{` to the end of text, for replies cut off mid-object.
pub fn unterminated_object(text: &str) -> Option<&str> {
    text.find('{').map(|start| &text[start..])
}

/// Candidate payloads in priority order: `json` fences, other fences, the
/// last balanced object, an unterminated trailing object, the whole text.
pub fn candidates(text: &str) -> Vec<&str> {
    let blocks = fenced_blocks(text);
    let mut out: Vec<&str> = Vec::new();

    let json_first = blocks
        .iter()
        .filter(|(hint, _)| hint.is_some_and(|h| h.eq_ignore_ascii_case("json")))
        .chain(
            blocks
                .iter()
                .filter(|(hint, _)| !hint.is_some_and(|h| h.eq_ignore_ascii_case("json"))),
        );
    for (_, body) in json_first {
        out.push(*body);
    }
    if let Some(obj) = last_balanced_object(text) {
        out.push(obj);
    } else if let Some(tail) = unterminated_object(text) {
        out.push(tail);
    }
    out.push(text);

    let mut seen = std::collections::HashSet::new();
    out.retain(|c| seen.insert(*c));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_balanced_prefers_later_object() {
        let text = r#"Example: {"a": 1}. Final: {"b": {"c": "}"}}"#;
        assert_eq!(last_balanced_object(text), Some(r#"{"b": {"c": "}"}}"#));
    }

    #[test]
    fn test_last_balanced_array_spans_objects() {
        let text = r#"Calling both: [{"a": "]"}, {"b": 2}] now"#;
        assert_eq!(last_balanced_array(text), Some(r#"[{"a": "]"}, {"b": 2}]"#));
        assert_eq!(last_balanced_object(text), Some(r#"{"b": 2}"#));
    }

    #[test]
    fn test_last_balanced_none_when_unclosed() {
        assert_eq!(last_balanced_object(r#"{"a": 1"#), None);
        assert_eq!(unterminated_object(r#"ok {"a": 1"#), Some(r#"{"a": 1"#));
    }

    #[test]
    fn test_unclosed_fence_ignored() {
        assert!(fenced_blocks("```json\n{\"a\": 1}").is_empty());
    }

    #[test]
    fn test_candidate_order() {
        let text = "```\n{\"x\": 0}\n```\n```json\n{\"y\": 1}\n```";
        let c = candidates(text);
        assert_eq!(c[0], "{\"y\": 1}");
        assert_eq!(c[1], "{\"x\": 0}");
        assert_eq!(*c.last().unwrap(), text);
    }
}
