//! Best-effort repair of almost-JSON produced by models.
//!
//! One pass over the text fixes the common slips: single-quoted strings,
//! raw control characters inside strings, trailing commas, and brackets or
//! strings left open by a truncated reply. Anything else is left for the
//! decoder to reject.

/// Rewrite `input` into text more likely to decode as JSON.
///
/// # Examples
///
/// ```
/// use llm_runnables::output_parser::repair::repair_json;
///
/// assert_eq!(repair_json("{'a': 'b',}"), r#"{"a": "b"}"#);
/// assert_eq!(repair_json(r#"{"a": [1, 2"#), r#"{"a": [1, 2]}"#);
/// ```
pub fn repair_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            match ch {
                '\\' => match chars.next() {
                    // \' is not a JSON escape
                    Some('\'') => out.push('\''),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => {}
                },
                c if c == q => {
                    out.push('"');
                    quote = None;
                }
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c => out.push(c),
            }
            continue;
        }

        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                out.push('"');
            }
            '{' => {
                closers.push('}');
                out.push(ch);
            }
            '[' => {
                closers.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                if closers.last() == Some(&ch) {
                    closers.pop();
                }
                out.push(ch);
            }
            c => out.push(c),
        }
    }

    if quote.is_some() {
        out.push('"');
    }
    while let Some(closer) = closers.pop() {
        drop_trailing_comma(&mut out);
        out.push(closer);
    }
    out
}

fn drop_trailing_comma(out: &mut String) {
    let end = out.trim_end().len();
    if out[..end].ends_with(',') {
        out.truncate(end - 1);
    }
}
