//! Sequential composition of two stages.
//!
//! [`Chain`] runs its first stage, then feeds the output into its second.
//! Longer pipelines are nested chains; failures are reported against the
//! flattened position of the failing leaf stage, so the error is the same no
//! matter how the chain was grouped.

use crate::{
    error::Result,
    exec_ctx::ExecCtx,
    stage::{BoxFut, Stage},
    PipelineError,
};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

/// Two stages run back to back.
///
/// `Chain` itself implements [`Stage`], so chains nest and compose with
/// everything else.
///
/// # Example
///
/// ```
/// use llm_runnables::{compose, stage::{FnStage, StageExt}};
///
/// let trim = FnStage::new("trim", |s: String| Ok(s.trim().to_string()));
/// let upper = FnStage::new("upper", |s: String| Ok(s.to_uppercase()));
/// let count = FnStage::new("count", |s: String| Ok(s.len()));
///
/// let chain = compose(trim, upper).pipe(count);
/// ```
pub struct Chain<A, B> {
    name: String,
    first: A,
    second: B,
}

/// Compose two stages into a [`Chain`].
pub fn compose<A, B>(first: A, second: B) -> Chain<A, B> {
    Chain::new(first, second)
}

impl<A, B> Chain<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self {
            name: String::from("chain"),
            first,
            second,
        }
    }

    /// Set the name reported in events and logs.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn first(&self) -> &A {
        &self.first
    }

    pub fn second(&self) -> &B {
        &self.second
    }
}

/// Attach the failing stage's flat position to an error.
///
/// Errors coming out of a composite stage are already positioned relative to
/// that composite; only the offset is added.
fn at_position(err: PipelineError, offset: usize, stage: &str, composite: bool) -> PipelineError {
    match err {
        PipelineError::StageFailed {
            index,
            stage,
            source,
        } if composite => PipelineError::StageFailed {
            index: index + offset,
            stage,
            source,
        },
        other => PipelineError::StageFailed {
            index: offset,
            stage: stage.to_string(),
            source: Box::new(other),
        },
    }
}

impl<In, A, B> Stage<In> for Chain<A, B>
where
    In: Send,
    A: Stage<In>,
    B: Stage<A::Output>,
{
    type Output = B::Output;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxFut<'a, Result<B::Output>>
    where
        In: 'a,
    {
        Box::pin(async move {
            ctx.check_cancelled()?;
            debug!(chain = %self.name, stage = self.first.name(), "Running stage");
            let mid = self
                .first
                .invoke(ctx, input)
                .await
                .map_err(|e| at_position(e, 0, self.first.name(), self.first.len() > 1))?;

            ctx.check_cancelled()?;
            debug!(chain = %self.name, stage = self.second.name(), "Running stage");
            self.second.invoke(ctx, mid).await.map_err(|e| {
                at_position(e, self.first.len(), self.second.name(), self.second.len() > 1)
            })
        })
    }

    fn stream<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxStream<'a, Result<B::Output>>
    where
        In: 'a,
    {
        let offset = self.first.len();
        let composite = self.second.len() > 1;

        let head = async move {
            if let Err(e) = ctx.check_cancelled() {
                return stream::once(future::ready(Err(e))).boxed();
            }
            match self.first.invoke(ctx, input).await {
                Ok(mid) => self
                    .second
                    .stream(ctx, mid)
                    .map(move |item| {
                        item.map_err(|e| at_position(e, offset, self.second.name(), composite))
                    })
                    .boxed(),
                Err(e) => {
                    let err = at_position(e, 0, self.first.name(), self.first.len() > 1);
                    stream::once(future::ready(Err(err))).boxed()
                }
            }
        };
        stream::once(head).flatten().boxed()
    }

    fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::exec_ctx::mock_ctx;
    use crate::model::ChatModel;
    use crate::stage::{FnStage, StageExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn append(tag: &'static str) -> impl Stage<String, Output = String> {
        FnStage::new(tag, move |s: String| Ok(format!("{s}{tag}")))
    }

    fn failing(tag: &'static str) -> impl Stage<String, Output = String> {
        FnStage::new(tag, |_s: String| -> Result<String> {
            Err(PipelineError::Other("boom".into()))
        })
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let chain = append("a").pipe(append("b")).pipe(append("c"));
        assert_eq!(chain.invoke(&ctx, ">".into()).await.unwrap(), ">abc");
        assert_eq!(chain.len(), 3);
    }

    #[tokio::test]
    async fn test_composition_is_associative() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let left = compose(compose(append("a"), append("b")), append("c"));
        let right = compose(append("a"), compose(append("b"), append("c")));
        for input in ["", "x", "hello "] {
            assert_eq!(
                left.invoke(&ctx, input.into()).await.unwrap(),
                right.invoke(&ctx, input.into()).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_failure_index_independent_of_grouping() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let left = compose(compose(append("a"), append("b")), failing("c"));
        let right = compose(append("a"), compose(append("b"), failing("c")));

        for err in [
            left.invoke(&ctx, String::new()).await.unwrap_err(),
            right.invoke(&ctx, String::new()).await.unwrap_err(),
        ] {
            match err {
                PipelineError::StageFailed { index, stage, source } => {
                    assert_eq!(index, 2);
                    assert_eq!(stage, "c");
                    assert!(matches!(*source, PipelineError::Other(_)));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[tokio::test]
    async fn test_no_stage_runs_after_failure() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let after = FnStage::new("after", move |s: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(s)
        });
        let chain = append("a").pipe(failing("b")).pipe(after);
        let err = chain.invoke(&ctx, String::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { index: 1, .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_of_non_streaming_tail_yields_single_fragment() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let chain = append("a").pipe(append("b"));
        let fragments: Vec<String> = chain
            .stream(&ctx, "x".into())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["xab"]);
    }

    #[tokio::test]
    async fn test_stream_concatenation_equals_invoke() {
        let ctx = mock_ctx(MockBackend::fixed("The quick brown fox jumps"));
        let chain = append(" please").pipe(ChatModel::new("test-model"));

        let invoked = chain.invoke(&ctx, "Tell me".into()).await.unwrap();
        let fragments: Vec<String> = chain
            .stream(&ctx, "Tell me".into())
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), invoked);
    }

    #[tokio::test]
    async fn test_stream_error_carries_position() {
        let ctx = mock_ctx(MockBackend::scripted(vec![MockReply::Status(400)]));
        let chain = append("a").pipe(ChatModel::new("test-model").with_name("llm"));
        let items: Vec<Result<String>> = chain.stream(&ctx, "x".into()).collect().await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(PipelineError::StageFailed { index, stage, .. }) => {
                assert_eq!(*index, 1);
                assert_eq!(stage, "llm");
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
