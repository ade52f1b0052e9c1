//! Scripted backend for testing without a live model.
//!
//! [`MockBackend`] plays back a script of [`MockReply`] values in order,
//! cycling when the script runs out, and records every request it saw.
//!
//! # Example
//!
//! ```
//! use llm_runnables::backend::{MockBackend, MockReply};
//!
//! let mock = MockBackend::scripted(vec![
//!     MockReply::text("Hello, world!"),
//!     MockReply::interrupted(["Hel", "lo"], "connection reset"),
//! ]);
//! assert_eq!(mock.calls(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;

use super::{Backend, FragmentStream, LlmRequest, LlmResponse, ToolCall};
use crate::error::Result;
use crate::PipelineError;

/// One scripted backend behavior.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// A complete text message. Streamed word by word.
    Text(String),
    /// A message requesting native tool calls.
    ToolCalls(Vec<ToolCall>),
    /// Explicit fragments, optionally followed by an abnormal termination.
    Fragments {
        parts: Vec<String>,
        fail_with: Option<String>,
    },
    /// A non-success HTTP status.
    Status(u16),
    /// Never answers; exercises timeouts.
    Hang,
    /// Streams these fragments, then goes silent without closing.
    /// Non-streaming calls hang.
    Stall(Vec<String>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    /// A single native tool call.
    pub fn tool_call(id: &str, name: &str, input: &str) -> Self {
        MockReply::ToolCalls(vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: input.to_string(),
        }])
    }

    /// Fragments followed by a connection failure.
    pub fn interrupted<I, S>(parts: I, reason: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockReply::Fragments {
            parts: parts.into_iter().map(Into::into).collect(),
            fail_with: Some(reason.to_string()),
        }
    }
}

/// A test backend that plays back scripted replies in order.
#[derive(Debug)]
pub struct MockBackend {
    script: Vec<MockReply>,
    index: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockBackend {
    /// Script of plain text replies.
    pub fn new(responses: Vec<String>) -> Self {
        Self::scripted(responses.into_iter().map(MockReply::Text).collect())
    }

    /// A mock that always returns the same text.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Arbitrary script; cycles from the start when exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `script` is empty.
    pub fn scripted(script: Vec<MockReply>) -> Self {
        assert!(!script.is_empty(), "MockBackend requires at least one reply");
        Self {
            script,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls made so far (complete and stream).
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_reply(&self, request: &LlmRequest) -> MockReply {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        let idx = self.index.fetch_add(1, Ordering::SeqCst) % self.script.len();
        self.script[idx].clone()
    }
}

fn status_error(status: u16) -> PipelineError {
    PipelineError::HttpError {
        status,
        body: "scripted failure".into(),
        retry_after: None,
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let (text, tool_calls) = match self.next_reply(request) {
            MockReply::Text(text) => (text, Vec::new()),
            MockReply::ToolCalls(calls) => (String::new(), calls),
            MockReply::Fragments { fail_with: Some(reason), .. } => {
                return Err(PipelineError::Other(reason))
            }
            MockReply::Fragments { parts, .. } => (parts.concat(), Vec::new()),
            MockReply::Status(status) => return Err(status_error(status)),
            MockReply::Hang | MockReply::Stall(_) => std::future::pending().await,
        };
        Ok(LlmResponse {
            text,
            tool_calls,
            status: 200,
            metadata: None,
        })
    }

    async fn stream(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<FragmentStream> {
        let (parts, fail_with) = match self.next_reply(request) {
            MockReply::Text(text) => (
                text.split_inclusive(' ').map(str::to_string).collect(),
                None,
            ),
            MockReply::ToolCalls(_) => (Vec::new(), None),
            MockReply::Fragments { parts, fail_with } => (parts, fail_with),
            MockReply::Status(status) => return Err(status_error(status)),
            MockReply::Hang => std::future::pending().await,
            MockReply::Stall(parts) => {
                return Ok(stream::iter(parts.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed())
            }
        };
        let tail = fail_with.map(|reason| Err(PipelineError::Other(reason)));
        Ok(stream::iter(parts.into_iter().map(Ok).chain(tail)).boxed())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;

    fn request() -> LlmRequest {
        LlmRequest {
            model: "test".to_string(),
            messages: vec![ChatMessage::user("hi")],
            config: Default::default(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_cycles_responses() {
        let mock = MockBackend::new(vec!["first".into(), "second".into()]);
        let client = Client::new();
        let r1 = mock.complete(&client, "http://unused", &request()).await.unwrap();
        let r2 = mock.complete(&client, "http://unused", &request()).await.unwrap();
        let r3 = mock.complete(&client, "http://unused", &request()).await.unwrap();
        assert_eq!(r1.text, "first");
        assert_eq!(r2.text, "second");
        assert_eq!(r3.text, "first");
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_streams_words() {
        let mock = MockBackend::fixed("one two three");
        let fragments: Vec<String> = mock
            .stream(&Client::new(), "http://unused", &request())
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["one ", "two ", "three"]);
    }

    #[tokio::test]
    async fn test_mock_interrupted_stream() {
        let mock = MockBackend::scripted(vec![MockReply::interrupted(["Hel", "lo"], "reset")]);
        let items: Vec<Result<String>> = mock
            .stream(&Client::new(), "http://unused", &request())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_deref().unwrap(), "Hel");
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn test_mock_status_and_tool_calls() {
        let mock = MockBackend::scripted(vec![
            MockReply::Status(503),
            MockReply::tool_call("c1", "add", "1,2"),
        ]);
        let client = Client::new();
        let err = mock.complete(&client, "x", &request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::HttpError { status: 503, .. }));
        let resp = mock.complete(&client, "x", &request()).await.unwrap();
        assert_eq!(resp.tool_calls[0].name, "add");
        assert!(resp.text.is_empty());
    }
}
