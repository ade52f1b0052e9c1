//! Backend for OpenAI-compatible chat completion APIs.
//!
//! Covers OpenAI, DeepSeek, vLLM, llama.cpp server, LM Studio, Groq, and
//! any other provider speaking `/v1/chat/completions`.
//! Streaming: SSE with `data: {"choices": [{"delta": {"content": "token"}}]}`
//! terminated by `data: [DONE]`.

use std::collections::VecDeque;

use super::sse::{SseDecoder, SseEvent};
use super::{Backend, ChatMessage, FragmentStream, LlmRequest, LlmResponse, ToolCall, ToolSpec};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

/// Name of the single string parameter every tool exposes to the provider.
const TOOL_INPUT_PARAM: &str = "input";

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use llm_runnables::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new().with_api_key("sk-...");
/// assert!(backend.has_api_key());
/// ```
#[derive(Clone, Default)]
pub struct OpenAiBackend {
    /// Optional API key. If set, sent as `Authorization: Bearer {key}`.
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| match k.get(..6) {
                    Some(prefix) if k.len() > 6 => format!("{}***", prefix),
                    _ => "***".to_string(),
                }),
            )
            .finish()
    }
}

impl OpenAiBackend {
    /// Create a backend without authentication.
    pub fn new() -> Self {
        Self { api_key: None }
    }

    /// Set the API key for authentication.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Returns `true` if an API key has been configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn message_json(msg: &ChatMessage) -> Value {
        let mut value = json!({"role": msg.role.as_str(), "content": msg.content});
        if !msg.tool_calls.is_empty() {
            value["tool_calls"] = msg
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": json!({ "input": call.input }).to_string(),
                        },
                    })
                })
                .collect();
        }
        if let Some(ref id) = msg.tool_call_id {
            value["tool_call_id"] = json!(id);
        }
        value
    }

    fn tool_json(spec: &ToolSpec) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": spec.name,
                "description": spec.description,
                "parameters": {
                    "type": "object",
                    "properties": {
                        "input": {"type": "string", "description": "Tool input"},
                    },
                    "required": [TOOL_INPUT_PARAM],
                },
            },
        })
    }

    /// Build the request body for `/v1/chat/completions`.
    fn build_body(request: &LlmRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages.iter().map(Self::message_json).collect::<Vec<_>>(),
            "temperature": request.config.temperature,
            "stream": stream,
        });

        if let Some(max_tokens) = request.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.config.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if !request.tools.is_empty() {
            body["tools"] = request.tools.iter().map(Self::tool_json).collect();
        }

        body
    }

    /// Parse a `Retry-After` header value as seconds.
    fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
        value
            .trim()
            .parse::<u64>()
            .ok()
            .map(std::time::Duration::from_secs)
    }

    fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
        let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
            return Vec::new();
        };
        calls
            .iter()
            .filter_map(|call| {
                let function = call.get("function")?;
                let name = function.get("name")?.as_str()?.to_string();
                let raw_args = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let input = match serde_json::from_str::<Value>(raw_args) {
                    Ok(Value::Object(map)) => match map.get(TOOL_INPUT_PARAM) {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => raw_args.to_string(),
                    },
                    _ => raw_args.to_string(),
                };
                Some(ToolCall {
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name,
                    input,
                })
            })
            .collect()
    }

    fn delta_content(value: &Value) -> Option<&str> {
        value
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
            .filter(|s| !s.is_empty())
    }

    /// Send the request and map non-success statuses to [`PipelineError::HttpError`].
    async fn send(
        &self,
        client: &Client,
        base_url: &str,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let mut req = client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        Err(PipelineError::HttpError {
            status,
            body,
            retry_after,
        })
    }
}

/// State threaded through the SSE fragment stream.
struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl SseState {
    /// Queue fragments from decoded events; returns `true` on `[DONE]`.
    fn absorb(&mut self, events: Vec<SseEvent>) -> bool {
        for event in events {
            match event {
                SseEvent::Done => return true,
                SseEvent::Data(value) => {
                    if let Some(content) = OpenAiBackend::delta_content(&value) {
                        self.pending.push_back(Ok(content.to_string()));
                    }
                }
            }
        }
        false
    }
}

fn sse_fragments(resp: reqwest::Response) -> FragmentStream {
    let state = SseState {
        bytes: resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.decode(&chunk);
                    st.finished = st.absorb(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(PipelineError::Request(e)));
                }
                None => {
                    st.finished = true;
                    let events = st.decoder.flush();
                    if !st.absorb(events) {
                        st.pending.push_back(Err(PipelineError::Other(
                            "connection closed before [DONE]".into(),
                        )));
                    }
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let body = Self::build_body(request, false);
        let resp = self.send(client, base_url, &body).await?;
        let status = resp.status().as_u16();
        let json_resp: Value = resp.json().await?;

        let message = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .cloned()
            .unwrap_or(Value::Null);
        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = Self::parse_tool_calls(&message);
        debug!(status, tool_calls = tool_calls.len(), "Chat completion received");

        Ok(LlmResponse {
            text,
            tool_calls,
            status,
            metadata: json_resp.get("usage").cloned(),
        })
    }

    async fn stream(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<FragmentStream> {
        let body = Self::build_body(request, true);
        let resp = self.send(client, base_url, &body).await?;
        Ok(sse_fragments(resp))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
