//! Fan-out/fan-in composition.
//!
//! [`ParallelGroup`] hands a clone of one input to every named branch, runs
//! the branches concurrently, and merges their outputs into a map keyed by
//! branch name. The first failing branch fails the whole group; the other
//! branches are dropped mid-flight and nothing partial is returned.

use std::collections::BTreeMap;

use crate::{
    error::Result,
    exec_ctx::ExecCtx,
    stage::{BoxFut, Stage},
    PipelineError,
};
use futures::future::try_join_all;
use tracing::debug;

type Branch<In, Out> = (String, Box<dyn Stage<In, Output = Out>>);

/// Named branches run concurrently on the same input.
///
/// The merged map is ordered by branch name, so its contents never depend on
/// which branch finished first.
///
/// # Example
///
/// ```
/// use llm_runnables::{parallel::ParallelGroup, stage::FnStage};
///
/// let group = ParallelGroup::builder("stats")
///     .branch("chars", FnStage::new("chars", |s: String| Ok(s.chars().count())))
///     .branch("words", FnStage::new("words", |s: String| Ok(s.split_whitespace().count())))
///     .build()
///     .unwrap();
/// assert_eq!(group.branch_names(), vec!["chars", "words"]);
/// ```
pub struct ParallelGroup<In, Out> {
    name: String,
    branches: Vec<Branch<In, Out>>,
}

impl<In, Out> ParallelGroup<In, Out> {
    pub fn builder(name: impl Into<String>) -> ParallelGroupBuilder<In, Out> {
        ParallelGroupBuilder {
            name: name.into(),
            branches: Vec::new(),
        }
    }

    pub fn branch_names(&self) -> Vec<&str> {
        self.branches.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Builder for [`ParallelGroup`].
pub struct ParallelGroupBuilder<In, Out> {
    name: String,
    branches: Vec<Branch<In, Out>>,
}

impl<In, Out> ParallelGroupBuilder<In, Out>
where
    In: Send,
    Out: Send,
{
    /// Add a branch under `name`.
    pub fn branch<S>(mut self, name: impl Into<String>, stage: S) -> Self
    where
        S: Stage<In, Output = Out> + 'static,
    {
        self.branches.push((name.into(), Box::new(stage)));
        self
    }

    /// Validate branch names and build the group.
    pub fn build(self) -> Result<ParallelGroup<In, Out>> {
        if self.branches.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "parallel group '{}' has no branches",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for (name, _) in &self.branches {
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "parallel group '{}' has duplicate branch '{}'",
                    self.name, name
                )));
            }
        }
        Ok(ParallelGroup {
            name: self.name,
            branches: self.branches,
        })
    }
}

impl<In, Out> Stage<In> for ParallelGroup<In, Out>
where
    In: Clone + Send + Sync,
    Out: Send,
{
    type Output = BTreeMap<String, Out>;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: In) -> BoxFut<'a, Result<Self::Output>>
    where
        In: 'a,
    {
        Box::pin(async move {
            ctx.check_cancelled()?;
            debug!(group = %self.name, branches = self.branches.len(), "Fanning out");

            let runs = self.branches.iter().map(|(branch, stage)| {
                let input = input.clone();
                async move {
                    match stage.invoke(ctx, input).await {
                        Ok(out) => Ok((branch.clone(), out)),
                        Err(e) => Err(PipelineError::BranchFailed {
                            group: self.name.clone(),
                            branch: branch.clone(),
                            source: Box::new(e),
                        }),
                    }
                }
            });
            let merged = try_join_all(runs).await?;
            Ok(merged.into_iter().collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::chain::compose;
    use crate::exec_ctx::mock_ctx;
    use crate::stage::FnStage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Sleeps, then returns a fixed value or an error.
    struct Delayed {
        delay: Duration,
        output: Option<&'static str>,
        finished: Arc<AtomicBool>,
    }

    impl Delayed {
        fn ok(ms: u64, output: &'static str) -> Self {
            Self {
                delay: Duration::from_millis(ms),
                output: Some(output),
                finished: Arc::new(AtomicBool::new(false)),
            }
        }

        fn fail(ms: u64) -> Self {
            Self {
                output: None,
                ..Self::ok(ms, "")
            }
        }
    }

    impl Stage<String> for Delayed {
        type Output = String;

        fn name(&self) -> &str {
            "delayed"
        }

        fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, _input: String) -> BoxFut<'a, Result<String>>
        where
            String: 'a,
        {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.finished.store(true, Ordering::SeqCst);
                self.output
                    .map(str::to_string)
                    .ok_or_else(|| PipelineError::Other("branch exploded".into()))
            })
        }
    }

    #[tokio::test]
    async fn test_merge_independent_of_completion_order() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let group = ParallelGroup::builder("nums")
            .branch("a", Delayed::ok(30, "4"))
            .branch("b", Delayed::ok(0, "5"))
            .branch("c", Delayed::ok(15, "6"))
            .build()
            .unwrap();

        let result = group.invoke(&ctx, "3".to_string()).await.unwrap();
        let expected: BTreeMap<String, String> = [("a", "4"), ("b", "5"), ("c", "6")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(result, expected);
    }

    #[tokio::test]
    async fn test_fail_fast_discards_siblings() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let slow = Delayed::ok(200, "6");
        let slow_done = slow.finished.clone();
        let group = ParallelGroup::builder("nums")
            .branch("a", Delayed::ok(0, "4"))
            .branch("b", Delayed::fail(10))
            .branch("c", slow)
            .build()
            .unwrap();

        let err = group.invoke(&ctx, "x".to_string()).await.unwrap_err();
        match &err {
            PipelineError::BranchFailed { group, branch, .. } => {
                assert_eq!(group, "nums");
                assert_eq!(branch, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!slow_done.load(Ordering::SeqCst), "sibling kept running");
    }

    #[tokio::test]
    async fn test_every_branch_sees_same_input() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let group = ParallelGroup::builder("echo")
            .branch("x", FnStage::new("x", |s: String| Ok(format!("x:{s}"))))
            .branch("y", FnStage::new("y", |s: String| Ok(format!("y:{s}"))))
            .build()
            .unwrap();
        let result = group.invoke(&ctx, "in".to_string()).await.unwrap();
        assert_eq!(result["x"], "x:in");
        assert_eq!(result["y"], "y:in");
    }

    #[tokio::test]
    async fn test_group_composes_inside_chain() {
        let ctx = mock_ctx(MockBackend::fixed("unused"));
        let group = ParallelGroup::builder("g")
            .branch("len", FnStage::new("len", |s: String| Ok(s.len())))
            .build()
            .unwrap();
        let chain = compose(
            group,
            FnStage::new("total", |m: BTreeMap<String, usize>| Ok(m.values().sum::<usize>())),
        );
        assert_eq!(chain.invoke(&ctx, "abcd".to_string()).await.unwrap(), 4);
    }

    #[test]
    fn test_build_rejects_duplicates_and_empty() {
        let dup = ParallelGroup::<String, String>::builder("g")
            .branch("a", FnStage::new("a", |s: String| Ok(s)))
            .branch("a", FnStage::new("a2", |s: String| Ok(s)))
            .build();
        assert!(matches!(dup, Err(PipelineError::InvalidConfig(_))));

        let empty = ParallelGroup::<String, String>::builder("g").build();
        assert!(matches!(empty, Err(PipelineError::InvalidConfig(_))));
    }
}
