//! Model-call collaborator: backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over LLM providers, translating between
//! normalized [`LlmRequest`]/[`LlmResponse`] types and provider-specific
//! HTTP APIs. Built-in implementations: [`OpenAiBackend`] and, for tests,
//! [`MockBackend`].
//!
//! ## Architecture
//!
//! ```text
//! ChatModel ──► LlmRequest ──► with_backoff(timeout, retries)
//!                                   │
//!                     Backend::complete() / Backend::stream()
//!                                   │
//!                ┌──────────────────┴──────────────────┐
//!          OpenAiBackend                          MockBackend
//!     /v1/chat/completions                     scripted replies
//!     SSE fragments, [DONE]                  scripted fragment streams
//! ```

pub mod backoff;
pub mod mock;
pub mod openai;
pub mod sse;

pub use backoff::BackoffConfig;
pub use mock::{MockBackend, MockReply};
pub use openai::OpenAiBackend;

use crate::config::LlmConfig;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Type alias for the callback invoked before each transport retry.
///
/// Arguments: `(attempt_number, delay_before_retry, reason_for_retry)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &str) + Send)>;

/// A lazy sequence of text fragments from a streaming model call.
///
/// The sequence is finite and consumed once. An `Err` item means the stream
/// terminated abnormally; no items follow it.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
    /// Result of a native tool call.
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    /// Provider-assigned (or locally generated) call identifier.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// The single string argument for the tool.
    pub input: String,
}

/// A tool advertised to the model for native function calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
    /// Tool calls requested by an assistant message.
    pub tool_calls: Vec<ToolCall>,
    /// For [`Role::Tool`] messages, the call this result answers.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The result of a native tool call, linked to the request by id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A normalized model request, provider-agnostic.
///
/// Retries resend the identical value.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"deepseek-chat"`, `"gpt-4o"`).
    pub model: String,
    /// Ordered, role-tagged conversation.
    pub messages: Vec<ChatMessage>,
    /// Sampling parameters, passed through opaquely.
    pub config: LlmConfig,
    /// Tools available for native function calling. Empty disables it.
    pub tools: Vec<ToolSpec>,
}

/// A normalized model response.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,
    /// Native tool calls requested by the model, if any.
    pub tool_calls: Vec<ToolCall>,
    /// HTTP status code (for diagnostics/logging).
    pub status: u16,
    /// Provider-specific metadata (token counts, model info).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over model providers.
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a non-streaming call and return the complete message.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Open a streaming call.
    ///
    /// Returns once the provider has accepted the request; fragments are
    /// pulled lazily from the returned stream.
    async fn stream(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<FragmentStream>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Check whether a [`PipelineError`] is retryable based on the backoff config.
///
/// Retryable conditions:
/// - [`PipelineError::HttpError`] with a status in `config.retryable_statuses`
/// - [`PipelineError::Request`] (connection/transport errors)
/// - [`PipelineError::Timeout`]
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) | PipelineError::Timeout(_) => true,
        _ => false,
    }
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<()> {
    match cancel {
        Some(flag) if flag.load(Ordering::Relaxed) => Err(PipelineError::Cancelled),
        _ => Ok(()),
    }
}

/// Bound the wait for each fragment of an open stream.
///
/// A gap longer than `limit` ends the stream with [`PipelineError::Timeout`];
/// nothing is pulled from `fragments` after that.
pub fn idle_timeout(fragments: FragmentStream, limit: Duration) -> FragmentStream {
    stream::unfold(Some(fragments), move |state| async move {
        let mut fragments = state?;
        match tokio::time::timeout(limit, fragments.next()).await {
            Ok(Some(item)) => Some((item, Some(fragments))),
            Ok(None) => None,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "Model stream stalled");
                Some((Err(PipelineError::Timeout(limit)), None))
            }
        }
    })
    .boxed()
}

/// Run a model call with a per-attempt timeout and transport-level retry.
///
/// `attempt` is called once per try and must issue the same request each
/// time. A timed-out attempt is treated like any other retryable failure.
/// Returns the first success, or the last error once retries are exhausted.
pub async fn with_backoff<T, F, Fut>(
    config: &BackoffConfig,
    timeout: Duration,
    cancel: Option<&AtomicBool>,
    mut on_retry: RetryCallback<'_>,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<PipelineError> = None;

    for n in 0..=config.max_retries {
        check_cancel(cancel)?;

        if n > 0 {
            let delay = match &last_error {
                Some(PipelineError::HttpError {
                    retry_after: Some(ra),
                    ..
                }) if config.respect_retry_after => *ra,
                _ => config.delay_for_attempt(n - 1),
            };
            let reason = last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();

            warn!(attempt = n, delay_ms = delay.as_millis() as u64, %reason, "Retrying model call");
            if let Some(ref mut cb) = on_retry {
                cb(n, delay, &reason);
            }

            tokio::time::sleep(delay).await;
            check_cancel(cancel)?;
        }

        let outcome = match tokio::time::timeout(timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if n < config.max_retries && is_retryable(&e, config) => {
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        PipelineError::Other("backoff loop exited unexpectedly".into())
    }))
}
