//! The chat model stage.
//!
//! [`ChatModel`] turns a role-tagged message list (or a bare user string)
//! into the model's reply text. It is the only stage that talks to the
//! backend, so it owns the per-call timeout and transport retry policy, and
//! it is the source of `Token` events when streaming.

use std::time::Duration;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info};

use crate::{
    aggregate,
    backend::{self, ChatMessage, FragmentStream, LlmRequest, LlmResponse, ToolSpec},
    config::LlmConfig,
    error::Result,
    events::{emit, Event},
    exec_ctx::ExecCtx,
    stage::{BoxFut, Stage},
};

/// A model invocation stage.
///
/// # Example
///
/// ```
/// use llm_runnables::{config::LlmConfig, model::ChatModel};
///
/// let model = ChatModel::new("deepseek-chat")
///     .with_name("summarizer")
///     .with_config(LlmConfig::default().with_temperature(0.0))
///     .with_streaming(true);
/// assert_eq!(model.model(), "deepseek-chat");
/// ```
#[derive(Debug, Clone)]
pub struct ChatModel {
    name: String,
    model: String,
    config: LlmConfig,
    streaming: bool,
    tools: Vec<ToolSpec>,
}

impl ChatModel {
    /// Create a model stage. The instance name defaults to the model id.
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            name: model.clone(),
            model,
            config: LlmConfig::default(),
            streaming: false,
            tools: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    /// When enabled, `invoke` consumes the streaming endpoint and emits
    /// `Token` events while aggregating the reply.
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Advertise tools for native function calling.
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Build the request sent for `messages`.
    pub fn request(&self, messages: Vec<ChatMessage>) -> LlmRequest {
        LlmRequest {
            model: self.model.clone(),
            messages,
            config: self.config.clone(),
            tools: self.tools.clone(),
        }
    }

    /// Send one non-streaming request under the context's timeout and retry policy.
    ///
    /// Retries resend the identical request.
    pub async fn complete(&self, ctx: &ExecCtx, request: &LlmRequest) -> Result<LlmResponse> {
        let name = self.name.clone();
        let handler = ctx.event_handler.clone();
        let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
            emit(
                &handler,
                Event::TransportRetry {
                    name: name.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: reason.to_string(),
                },
            );
        };

        let backend = &ctx.backend;
        let client = &ctx.client;
        let base_url = ctx.base_url.as_str();
        let response = backend::with_backoff(
            &ctx.backoff,
            ctx.timeout,
            ctx.cancel_flag(),
            Some(&mut on_retry),
            move || backend.complete(client, base_url, request),
        )
        .await?;

        debug!(
            stage = %self.name,
            status = response.status,
            chars = response.text.len(),
            tool_calls = response.tool_calls.len(),
            "Model call complete"
        );
        Ok(response)
    }

    /// Open a streaming request. The timeout and retries cover opening the
    /// stream; after that the same timeout bounds the wait for each fragment,
    /// and any failure ends the stream with an error item.
    pub async fn open_stream(&self, ctx: &ExecCtx, request: &LlmRequest) -> Result<FragmentStream> {
        let name = self.name.clone();
        let handler = ctx.event_handler.clone();
        let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
            emit(
                &handler,
                Event::TransportRetry {
                    name: name.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: reason.to_string(),
                },
            );
        };

        let backend = &ctx.backend;
        let client = &ctx.client;
        let base_url = ctx.base_url.as_str();
        backend::with_backoff(
            &ctx.backoff,
            ctx.timeout,
            ctx.cancel_flag(),
            Some(&mut on_retry),
            move || backend.stream(client, base_url, request),
        )
        .await
        .map(|fragments| backend::idle_timeout(fragments, ctx.timeout))
    }

    async fn run(&self, ctx: &ExecCtx, messages: Vec<ChatMessage>) -> Result<String> {
        let request = self.request(messages);
        if !self.streaming {
            return self.complete(ctx, &request).await.map(|r| r.text);
        }

        let fragments = self.open_stream(ctx, &request).await?;
        let handler = ctx.event_handler.clone();
        aggregate::drain(fragments, |chunk| {
            emit(
                &handler,
                Event::Token {
                    name: self.name.clone(),
                    chunk: chunk.to_string(),
                },
            )
        })
        .await
    }
}

impl Stage<Vec<ChatMessage>> for ChatModel {
    type Output = String;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: Vec<ChatMessage>) -> BoxFut<'a, Result<String>>
    where
        Vec<ChatMessage>: 'a,
    {
        Box::pin(async move {
            ctx.check_cancelled()?;
            emit(
                &ctx.event_handler,
                Event::StageStart {
                    name: self.name.clone(),
                    kind: "chat-model",
                },
            );
            info!(
                stage = %self.name,
                model = %self.model,
                backend = ctx.backend.name(),
                messages = input.len(),
                streaming = self.streaming,
                "Calling model"
            );

            let result = self.run(ctx, input).await;

            emit(
                &ctx.event_handler,
                Event::StageEnd {
                    name: self.name.clone(),
                    ok: result.is_ok(),
                },
            );
            result
        })
    }

    /// Yields fragments as they arrive, each also reported as a `Token` event.
    ///
    /// An abnormal termination surfaces as a final `Err` item carrying the
    /// typed cause; collectors wrap it with the partial text.
    fn stream<'a>(&'a self, ctx: &'a ExecCtx, input: Vec<ChatMessage>) -> BoxStream<'a, Result<String>>
    where
        Vec<ChatMessage>: 'a,
    {
        let head = async move {
            if let Err(e) = ctx.check_cancelled() {
                return stream::once(future::ready(Err(e))).boxed();
            }
            info!(stage = %self.name, model = %self.model, "Opening model stream");
            let request = self.request(input);
            match self.open_stream(ctx, &request).await {
                Ok(fragments) => {
                    let name = self.name.clone();
                    let handler = ctx.event_handler.clone();
                    fragments
                        .inspect(move |item| {
                            if let Ok(chunk) = item {
                                emit(
                                    &handler,
                                    Event::Token {
                                        name: name.clone(),
                                        chunk: chunk.clone(),
                                    },
                                );
                            }
                        })
                        .boxed()
                }
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            }
        };
        stream::once(head).flatten().boxed()
    }
}

impl Stage<String> for ChatModel {
    type Output = String;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: String) -> BoxFut<'a, Result<String>>
    where
        String: 'a,
    {
        Stage::<Vec<ChatMessage>>::invoke(self, ctx, vec![ChatMessage::user(input)])
    }

    fn stream<'a>(&'a self, ctx: &'a ExecCtx, input: String) -> BoxStream<'a, Result<String>>
    where
        String: 'a,
    {
        Stage::<Vec<ChatMessage>>::stream(self, ctx, vec![ChatMessage::user(input)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackoffConfig, MockBackend, MockReply, Role};
    use crate::events::FnEventHandler;
    use crate::PipelineError;
    use std::sync::{Arc, Mutex};

    fn ctx_with(mock: Arc<MockBackend>, events: Arc<Mutex<Vec<Event>>>) -> ExecCtx {
        let sink = events.clone();
        ExecCtx::builder("http://mock.invalid")
            .backend(mock)
            .backoff(BackoffConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..BackoffConfig::standard()
            })
            .timeout(Duration::from_millis(50))
            .event_handler(Arc::new(FnEventHandler(move |e| {
                sink.lock().unwrap().push(e);
            })))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_sends_user_message_and_config() {
        let mock = Arc::new(MockBackend::fixed("Paris"));
        let ctx = ctx_with(mock.clone(), Arc::default());
        let model = ChatModel::new("m").with_config(LlmConfig::default().with_temperature(0.0));

        let out = model.invoke(&ctx, "Capital of France?".to_string()).await.unwrap();
        assert_eq!(out, "Paris");

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "m");
        assert_eq!(requests[0].config.temperature, 0.0);
        assert_eq!(requests[0].messages[0].role, Role::User);
        assert_eq!(requests[0].messages[0].content, "Capital of France?");
    }

    #[tokio::test]
    async fn test_streaming_invoke_emits_tokens_in_order() {
        let mock = Arc::new(MockBackend::fixed("one two three"));
        let events = Arc::new(Mutex::new(Vec::new()));
        let ctx = ctx_with(mock, events.clone());
        let model = ChatModel::new("m").with_streaming(true);

        let out = model.invoke(&ctx, "count".to_string()).await.unwrap();
        assert_eq!(out, "one two three");

        let events = events.lock().unwrap();
        let tokens: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Event::Token { chunk, .. } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["one ", "two ", "three"]);
        assert!(matches!(events.first(), Some(Event::StageStart { kind: "chat-model", .. })));
        assert!(matches!(events.last(), Some(Event::StageEnd { ok: true, .. })));
    }

    #[tokio::test]
    async fn test_interrupted_stream_keeps_partial_text() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::interrupted(
            ["Hel", "lo"],
            "connection reset",
        )]));
        let ctx = ctx_with(mock, Arc::default());
        let model = ChatModel::new("m").with_streaming(true);

        match model.invoke(&ctx, "hi".to_string()).await.unwrap_err() {
            PipelineError::StreamInterrupted { partial, source } => {
                assert_eq!(partial, "Hello");
                assert!(source.to_string().contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out_with_partial_text() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::Stall(vec![
            "Hel".into(),
            "lo".into(),
        ])]));
        let ctx = ctx_with(mock.clone(), Arc::default());
        let model = ChatModel::new("m").with_streaming(true);

        match model.invoke(&ctx, "hi".to_string()).await.unwrap_err() {
            PipelineError::StreamInterrupted { partial, source } => {
                assert_eq!(partial, "Hello");
                assert!(matches!(*source, PipelineError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_with_identical_request() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::Status(503),
            MockReply::text("ok"),
        ]));
        let events = Arc::new(Mutex::new(Vec::new()));
        let ctx = ctx_with(mock.clone(), events.clone());

        let out = ChatModel::new("m").invoke(&ctx, "q".to_string()).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(mock.calls(), 2);

        let requests = mock.requests();
        assert_eq!(requests[0].messages, requests[1].messages);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::TransportRetry { attempt: 1, .. })));
    }

    #[tokio::test]
    async fn test_hanging_backend_times_out_after_retries() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::Hang]));
        let ctx = ctx_with(mock.clone(), Arc::default());

        let err = ChatModel::new("m").invoke(&ctx, "q".to_string()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_stream_yields_raw_fragments() {
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::interrupted(["a", "b"], "eof")]));
        let ctx = ctx_with(mock, Arc::default());
        let items: Vec<Result<String>> = ChatModel::new("m")
            .stream(&ctx, "x".to_string())
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_deref().unwrap(), "b");
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn test_tools_attached_to_request() {
        let model = ChatModel::new("m").with_tools(vec![ToolSpec {
            name: "calculator_add".into(),
            description: "Adds two numbers".into(),
        }]);
        let request = model.request(vec![ChatMessage::user("1+1")]);
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].name, "calculator_add");
    }
}
