//! Tools the agent loop can call, and the registry that dispatches them.
//!
//! A tool takes one string argument and returns one string. The registry
//! never fails outward: unknown names, tool errors, and tool panics all come
//! back as a [`ToolResult`] whose output describes what went wrong, so the
//! model can read it and recover.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{info, warn};

use crate::backend::ToolSpec;
use crate::error::Result;
use crate::PipelineError;

/// A named capability with a single string input.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Shown to the model verbatim.
    fn description(&self) -> &str;

    async fn call(&self, input: &str) -> anyhow::Result<String>;
}

/// A tool backed by a synchronous closure.
///
/// # Example
///
/// ```
/// use llm_runnables::tool::FnTool;
///
/// let echo = FnTool::new("echo", "Repeats the input", |s: &str| Ok(s.to_string()));
/// ```
pub struct FnTool<F> {
    name: String,
    description: String,
    f: F,
}

impl<F> FnTool<F>
where
    F: Fn(&str) -> anyhow::Result<String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(&str) -> anyhow::Result<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, input: &str) -> anyhow::Result<String> {
        (self.f)(input)
    }
}

/// How a tool invocation went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Ok,
    UnknownTool,
    /// The tool returned an error or panicked.
    Failed,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Ok => "ok",
            ToolStatus::UnknownTool => "unknown_tool",
            ToolStatus::Failed => "failed",
        }
    }
}

/// What the model sees after a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool: String,
    pub output: String,
    pub status: ToolStatus,
}

/// Tools keyed by unique name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A second tool with the same name is rejected.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(PipelineError::InvalidConfig(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: impl Tool + 'static) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// One `name: description` line per tool, sorted by name.
    pub fn describe(&self) -> String {
        self.tools
            .values()
            .map(|t| format!("{}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool specs for native function calling.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }

    /// Run the named tool. Never fails; problems are reported in the result.
    pub async fn invoke(&self, name: &str, input: &str) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = %name, "Unknown tool requested");
            return ToolResult {
                tool: name.to_string(),
                output: format!(
                    "Unknown tool '{}'. Available tools: {}",
                    name,
                    self.names().join(", ")
                ),
                status: ToolStatus::UnknownTool,
            };
        };

        let outcome = AssertUnwindSafe(tool.call(input)).catch_unwind().await;
        let (output, status) = match outcome {
            Ok(Ok(output)) => (output, ToolStatus::Ok),
            Ok(Err(e)) => (format!("Tool '{}' failed: {:#}", name, e), ToolStatus::Failed),
            Err(_) => (format!("Tool '{}' crashed", name), ToolStatus::Failed),
        };

        match status {
            ToolStatus::Ok => info!(tool = %name, status = status.as_str(), chars = output.len(), "Tool executed"),
            _ => warn!(tool = %name, status = status.as_str(), %output, "Tool execution failed"),
        }
        ToolResult {
            tool: name.to_string(),
            output,
            status,
        }
    }
}
