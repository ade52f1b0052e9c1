//! The [`Stage`] trait: the atomic, composable unit of a pipeline.
//!
//! A stage is a typed transform from one input value to one output value,
//! optionally suspending on I/O. Stages carry no per-call state, so a single
//! stage value can serve any number of concurrent invocations through `&self`.
//!
//! Composition is checked by the type system: `a.pipe(b)` only implements
//! [`Stage`] when `b` accepts `a`'s output type.

use crate::{chain::Chain, error::Result, exec_ctx::ExecCtx};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, pinned, Send future -- the return type of [`Stage::invoke`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe trait for pipeline stages.
///
/// `Stage<In>` is usable as `Box<dyn Stage<In, Output = Out>>`, which is how
/// [`ParallelGroup`](crate::parallel::ParallelGroup) stores heterogeneous
/// branch implementations.
pub trait Stage<In>: Send + Sync {
    /// What one invocation produces. For streaming stages, the fragment type.
    type Output: Send;

    /// Instance name, used in error context, events, and logs.
    fn name(&self) -> &str;

    /// Run to completion and return the whole output.
    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxFut<'a, Result<Self::Output>>
    where
        In: 'a;

    /// Run incrementally, yielding output fragments as they become available.
    ///
    /// Stages without native streaming yield their single complete result as
    /// one fragment.
    fn stream<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxStream<'a, Result<Self::Output>>
    where
        In: 'a,
    {
        stream::once(self.invoke(ctx, input)).boxed()
    }

    /// Number of leaf stages this stage is made of. Used to index failures.
    fn len(&self) -> usize {
        1
    }
}

impl<In, S: Stage<In> + ?Sized> Stage<In> for Box<S> {
    type Output = S::Output;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxFut<'a, Result<Self::Output>>
    where
        In: 'a,
    {
        (**self).invoke(ctx, input)
    }

    fn stream<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxStream<'a, Result<Self::Output>>
    where
        In: 'a,
    {
        (**self).stream(ctx, input)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

impl<In, S: Stage<In> + ?Sized> Stage<In> for Arc<S> {
    type Output = S::Output;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxFut<'a, Result<Self::Output>>
    where
        In: 'a,
    {
        (**self).invoke(ctx, input)
    }

    fn stream<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxStream<'a, Result<Self::Output>>
    where
        In: 'a,
    {
        (**self).stream(ctx, input)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// A stage backed by a synchronous closure.
///
/// # Example
///
/// ```
/// use llm_runnables::stage::FnStage;
///
/// let shout = FnStage::new("shout", |s: String| Ok(s.to_uppercase()));
/// ```
pub struct FnStage<F, In, Out> {
    name: String,
    f: F,
    _types: PhantomData<fn(In) -> Out>,
}

impl<F, In, Out> FnStage<F, In, Out>
where
    F: Fn(In) -> Result<Out> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _types: PhantomData,
        }
    }
}

impl<F, In, Out> Stage<In> for FnStage<F, In, Out>
where
    F: Fn(In) -> Result<Out> + Send + Sync,
    In: Send,
    Out: Send,
{
    type Output = Out;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, input: In) -> BoxFut<'a, Result<Out>>
    where
        In: 'a,
    {
        let result = (self.f)(input);
        Box::pin(async move { result })
    }
}

/// Sequential composition operator.
///
/// Available on every value; the resulting [`Chain`] implements [`Stage`]
/// only when the output of `self` is the input of `next`.
pub trait StageExt: Sized {
    /// Feed this stage's output into `next`.
    fn pipe<S>(self, next: S) -> Chain<Self, S> {
        Chain::new(self, next)
    }
}

impl<T: Send + Sync> StageExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::exec_ctx::mock_ctx;

    #[tokio::test]
    async fn test_fn_stage_invoke_and_default_stream() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let stage = FnStage::new("len", |s: String| Ok(s.len()));
        assert_eq!(stage.invoke(&ctx, "four".into()).await.unwrap(), 4);

        let fragments: Vec<usize> = stage
            .stream(&ctx, "abc".into())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec![3]);
    }

    #[tokio::test]
    async fn test_boxed_dyn_stage() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let boxed: Box<dyn Stage<String, Output = String>> =
            Box::new(FnStage::new("echo", |s: String| Ok(s)));
        assert_eq!(boxed.name(), "echo");
        assert_eq!(boxed.len(), 1);
        assert_eq!(boxed.invoke(&ctx, "x".into()).await.unwrap(), "x");
    }
}
