//! Stream aggregation: observe fragments as they arrive, then parse the whole.
//!
//! [`drain`] is the primitive. It forwards each fragment to an observer
//! before pulling the next one, so partial output is visible while the
//! stream is still open, and it never turns an abnormal termination into a
//! truncated success. [`StreamAggregator`] packages "stream a stage, join,
//! parse" as a stage of its own.

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::{
    error::Result,
    exec_ctx::ExecCtx,
    output_parser::{ParsedResult, StructuredParser},
    stage::{BoxFut, Stage},
    PipelineError,
};

/// Consume `fragments`, calling `observer` on each in arrival order, and
/// return their concatenation.
///
/// An `Err` item after at least one fragment ends the drain with
/// [`PipelineError::StreamInterrupted`], carrying every fragment observed
/// before it and the typed cause. An `Err` before any fragment is returned
/// unchanged.
///
/// # Example
///
/// ```
/// use futures::stream;
/// use llm_runnables::aggregate::drain;
///
/// # tokio_test::block_on(async {
/// let fragments = stream::iter(vec![Ok("Hel".to_string()), Ok("lo".to_string())]);
/// let mut seen = Vec::new();
/// let text = drain(fragments, |f| seen.push(f.to_string())).await.unwrap();
/// assert_eq!(text, "Hello");
/// assert_eq!(seen, vec!["Hel", "lo"]);
/// # });
/// ```
pub async fn drain<S, F>(fragments: S, mut observer: F) -> Result<String>
where
    S: Stream<Item = Result<String>>,
    F: FnMut(&str),
{
    let mut fragments = std::pin::pin!(fragments);
    let mut text = String::new();
    let mut count = 0usize;

    while let Some(item) = fragments.next().await {
        match item {
            Ok(fragment) => {
                observer(&fragment);
                text.push_str(&fragment);
                count += 1;
            }
            Err(e) if count == 0 => {
                debug!(error = %e, "Stream failed before any fragment");
                return Err(e);
            }
            Err(e) => {
                debug!(fragments = count, chars = text.len(), error = %e, "Stream interrupted");
                return Err(PipelineError::StreamInterrupted {
                    partial: text,
                    source: Box::new(e),
                });
            }
        }
    }
    debug!(fragments = count, chars = text.len(), "Stream drained");
    Ok(text)
}

/// [`drain`], then hand the full text to `parser`.
pub async fn drain_and_parse<S, F>(
    fragments: S,
    observer: F,
    parser: &StructuredParser,
) -> Result<ParsedResult>
where
    S: Stream<Item = Result<String>>,
    F: FnMut(&str),
{
    let text = drain(fragments, observer).await?;
    Ok(parser.parse(&text))
}

/// Wrap a streaming stage so its fragments are joined and parsed.
///
/// Fragment observation happens through the wrapped stage's own `Token`
/// events; the aggregator adds no events of its own.
///
/// # Example
///
/// ```
/// use llm_runnables::aggregate::stream_into;
/// use llm_runnables::model::ChatModel;
/// use llm_runnables::output_parser::{Schema, StructuredParser};
///
/// let schema = Schema::builder().field("answer", "the answer").build().unwrap();
/// let stage = stream_into(ChatModel::new("deepseek-chat"), StructuredParser::new(schema));
/// ```
pub fn stream_into<S>(source: S, parser: StructuredParser) -> StreamAggregator<S> {
    StreamAggregator::new(source, parser)
}

/// A stage that streams `source`, joins the fragments, and parses the result.
pub struct StreamAggregator<S> {
    name: String,
    source: S,
    parser: StructuredParser,
}

impl<S> StreamAggregator<S> {
    pub fn new(source: S, parser: StructuredParser) -> Self {
        Self {
            name: "stream-aggregator".to_string(),
            source,
            parser,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn parser(&self) -> &StructuredParser {
        &self.parser
    }
}

impl<In, S> Stage<In> for StreamAggregator<S>
where
    In: Send,
    S: Stage<In, Output = String>,
{
    type Output = ParsedResult;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxFut<'a, Result<ParsedResult>>
    where
        In: 'a,
    {
        Box::pin(async move {
            ctx.check_cancelled()?;
            let fragments = self.source.stream(ctx, input);
            drain_and_parse(fragments, |_| {}, &self.parser).await
        })
    }
}
