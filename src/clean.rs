//! Post-processing stages for model text.

use crate::{
    error::Result,
    exec_ctx::ExecCtx,
    stage::{BoxFut, Stage},
};

/// Remove every `open ... close` block from `text`, then trim.
///
/// An open tag without a matching close removes everything after it.
/// Removal repeats until nothing changes, so a tag spliced together from the
/// text around a removed block is removed too, and applying this twice is
/// the same as applying it once. An empty `open` matches nothing.
///
/// # Examples
///
/// ```
/// use llm_runnables::clean::strip_tagged;
///
/// assert_eq!(strip_tagged("<think>plan</think> red, green", "<think>", "</think>"), "red, green");
/// assert_eq!(strip_tagged("answer <think>cut off", "<think>", "</think>"), "answer");
/// ```
pub fn strip_tagged(text: &str, open: &str, close: &str) -> String {
    let mut current = text.trim().to_string();
    if open.is_empty() {
        return current;
    }
    loop {
        let next = strip_once(&current, open, close);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_once(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let after = &rest[start + open.len()..];
        match after.find(close) {
            Some(end) => rest = &after[end + close.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Strips a model's private reasoning block from its reply.
///
/// Defaults to `<think>` / `</think>`. An empty open tag disables stripping.
#[derive(Debug, Clone)]
pub struct StripReasoning {
    open: String,
    close: String,
}

impl StripReasoning {
    pub fn new() -> Self {
        Self::with_tags("<think>", "</think>")
    }

    pub fn with_tags(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    pub fn apply(&self, text: &str) -> String {
        strip_tagged(text, &self.open, &self.close)
    }
}

impl Default for StripReasoning {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage<String> for StripReasoning {
    type Output = String;

    fn name(&self) -> &str {
        "strip-reasoning"
    }

    fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, input: String) -> BoxFut<'a, Result<String>>
    where
        String: 'a,
    {
        let cleaned = self.apply(&input);
        Box::pin(async move { Ok(cleaned) })
    }
}

/// Splits text on a delimiter into trimmed, non-empty items.
#[derive(Debug, Clone)]
pub struct SplitList {
    delimiter: String,
}

impl SplitList {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }

    /// Comma-separated lists, the common case for "give me N items" prompts.
    pub fn comma() -> Self {
        Self::new(",")
    }

    pub fn apply(&self, text: &str) -> Vec<String> {
        text.split(self.delimiter.as_str())
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Stage<String> for SplitList {
    type Output = Vec<String>;

    fn name(&self) -> &str {
        "split-list"
    }

    fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, input: String) -> BoxFut<'a, Result<Vec<String>>>
    where
        String: 'a,
    {
        let items = self.apply(&input);
        Box::pin(async move { Ok(items) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::exec_ctx::mock_ctx;
    use crate::stage::StageExt;

    #[test]
    fn test_strip_is_idempotent() {
        let strip = StripReasoning::new();
        for text in [
            "<think>a</think>x<think>b</think>y",
            "  plain text  ",
            "<think>never closed",
            "",
            "before <think>mid</think> after",
            "<thi<think>x</think>nk>secret</think>answer",
        ] {
            let once = strip.apply(text);
            assert_eq!(strip.apply(&once), once, "input: {text:?}");
        }
    }

    #[test]
    fn test_spliced_tag_does_not_leak_reasoning() {
        let strip = StripReasoning::new();
        assert_eq!(strip.apply("<thi<think>x</think>nk>secret</think>answer"), "answer");
    }

    #[test]
    fn test_empty_open_tag_only_trims() {
        let strip = StripReasoning::with_tags("", "");
        assert_eq!(strip.apply("  keep <think>all</think> of it "), "keep <think>all</think> of it");
    }

    #[test]
    fn test_absent_markup_is_noop() {
        assert_eq!(StripReasoning::new().apply("red, green"), "red, green");
    }

    #[test]
    fn test_custom_tags() {
        let strip = StripReasoning::with_tags("<reasoning>", "</reasoning>");
        assert_eq!(strip.apply("<reasoning>x</reasoning>ok <think>kept</think>"), "ok <think>kept</think>");
    }

    #[test]
    fn test_split_drops_empty_items() {
        assert_eq!(
            SplitList::comma().apply(" red, green ,, blue ,"),
            vec!["red", "green", "blue"]
        );
        assert!(SplitList::comma().apply("  ").is_empty());
    }

    #[test]
    fn test_strip_then_split_chain() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let chain = StripReasoning::new().pipe(SplitList::comma());
        let items = tokio_test::block_on(
            chain.invoke(&ctx, "<think>colors?</think>red, green, blue".to_string()),
        )
        .unwrap();
        assert_eq!(items, vec!["red", "green", "blue"]);
    }
}
