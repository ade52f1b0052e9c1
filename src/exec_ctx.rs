//! Execution context shared across stage invocations.
//!
//! [`ExecCtx`] carries the HTTP client, model backend, endpoint, per-call
//! timeout, retry policy, cancellation handle, and optional event handler.
//! Build it once and share it by reference across every stage of a chain,
//! every branch of a parallel group, and every agent run.

use crate::backend::{Backend, BackoffConfig, OpenAiBackend};
use crate::error::Result;
use crate::events::EventHandler;
use reqwest::Client;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Shared execution context for stage invocations.
///
/// Holds no per-invocation state, so one context can serve any number of
/// concurrent, independent invocations.
///
/// # Example
///
/// ```
/// use llm_runnables::ExecCtx;
/// use std::time::Duration;
///
/// let ctx = ExecCtx::builder("https://api.deepseek.com/v1")
///     .openai_with_key("sk-...")
///     .timeout(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// assert_eq!(ctx.base_url, "https://api.deepseek.com");
/// ```
pub struct ExecCtx {
    /// HTTP client (cheap to clone -- uses `Arc` internally).
    pub client: Client,
    /// Base URL for the model provider, without the API path.
    pub base_url: String,
    /// Model backend. Default: [`OpenAiBackend`] without a key.
    pub backend: Arc<dyn Backend>,
    /// Transport retry configuration. Default: [`BackoffConfig::none()`].
    pub backoff: BackoffConfig,
    /// Upper bound for a single model call attempt.
    pub timeout: Duration,
    /// Optional cancellation flag; checked before stages, retries, and agent iterations.
    pub cancellation: Option<Arc<AtomicBool>>,
    /// Optional event handler for streaming tokens and lifecycle events.
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl ExecCtx {
    /// Create a new builder.
    pub fn builder(base_url: impl Into<String>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            backoff: None,
            cancellation: None,
            event_handler: None,
            timeout: None,
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Return an error if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(crate::PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Get a reference to the cancellation AtomicBool, if set.
    pub fn cancel_flag(&self) -> Option<&AtomicBool> {
        self.cancellation.as_deref()
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    backoff: Option<BackoffConfig>,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    timeout: Option<Duration>,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the model backend.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the OpenAI-compatible backend with a bearer credential.
    pub fn openai_with_key(mut self, api_key: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(OpenAiBackend::new().with_api_key(api_key)));
        self
    }

    /// Set the transport retry configuration. Default: [`BackoffConfig::none()`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Set the cancellation flag.
    pub fn cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(cancel);
        self
    }

    /// Set the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Set the per-call timeout. Default: 60 seconds.
    ///
    /// Applied around every model call attempt, independently of any
    /// timeout configured on a custom `Client`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the execution context.
    pub fn build(self) -> Result<ExecCtx> {
        let timeout = self.timeout.unwrap_or(Duration::from_secs(60));
        let client = match self.client {
            Some(client) => client,
            None => Client::builder().build()?,
        };
        Ok(ExecCtx {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(OpenAiBackend::new())),
            backoff: self.backoff.unwrap_or_else(BackoffConfig::none),
            timeout,
            cancellation: self.cancellation,
            event_handler: self.event_handler,
        })
    }
}

/// Strip known provider path suffixes so backends can append their own paths.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    for suffix in ["/v1/chat/completions", "/chat/completions", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
pub(crate) fn mock_ctx(backend: crate::backend::MockBackend) -> ExecCtx {
    ExecCtx::builder("http://mock.invalid")
        .backend(Arc::new(backend))
        .build()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url_strips_v1() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1"), "https://api.openai.com");
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com");
    }

    #[test]
    fn test_normalize_base_url_strips_full_path() {
        assert_eq!(
            normalize_base_url("https://api.deepseek.com/v1/chat/completions"),
            "https://api.deepseek.com"
        );
    }

    #[test]
    fn test_normalize_base_url_preserves_clean() {
        assert_eq!(normalize_base_url("http://localhost:8000"), "http://localhost:8000");
    }

    #[test]
    fn test_cancellation_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = ExecCtx::builder("http://localhost:8000")
            .cancellation(flag.clone())
            .build()
            .unwrap();
        assert!(ctx.check_cancelled().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(
            ctx.check_cancelled(),
            Err(crate::PipelineError::Cancelled)
        ));
    }

    #[test]
    fn test_default_timeout() {
        let ctx = ExecCtx::builder("http://localhost:8000").build().unwrap();
        assert_eq!(ctx.timeout, Duration::from_secs(60));
        assert_eq!(ctx.backend.name(), "openai");
        assert_eq!(ctx.backoff.max_retries, 0);
    }
}
