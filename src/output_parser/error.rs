//! Why a model reply did not yield a schema record.

/// Reasons a structured parse failed.
///
/// These travel inside [`ParsedResult::Unparsed`](super::ParsedResult) next
/// to the raw text; they only become errors under strict parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The reply was empty, whitespace-only, or only reasoning markup.
    #[error("empty model response")]
    EmptyResponse,

    /// Nothing in the reply decoded as JSON.
    #[error("no JSON payload found in model response: {excerpt}")]
    NoPayload {
        /// Start of the cleaned reply (max 120 chars).
        excerpt: String,
    },

    /// JSON was found, but it is not an object.
    #[error("JSON payload is not an object")]
    NotAnObject,

    /// An object was found, but required fields are absent.
    #[error("missing required fields: {}", missing.join(", "))]
    SchemaViolation {
        /// Schema field names absent from the payload, in schema order.
        missing: Vec<String>,
    },
}

/// Truncate to at most `max_chars` characters, appending "..." if cut.
pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}
