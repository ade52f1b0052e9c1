use std::time::Duration;
use thiserror::Error;

use crate::output_parser::ParseError;

/// Errors produced by stages, compositions, backends, and the agent loop.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, reset, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A model call did not complete within the configured timeout.
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A stage inside a chain failed.
    ///
    /// `index` is the zero-based position of the failing leaf stage in the
    /// flattened chain, so it does not depend on how the chain was grouped.
    #[error("stage {index} ('{stage}') failed: {source}")]
    StageFailed {
        index: usize,
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// A branch of a parallel group failed; sibling results were discarded.
    #[error("branch '{branch}' of parallel group '{group}' failed: {source}")]
    BranchFailed {
        group: String,
        branch: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// A fragment stream ended abnormally after producing `partial`.
    #[error("stream interrupted after {} bytes: {source}", partial.len())]
    StreamInterrupted {
        partial: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Strict structured parsing failed. The raw model text is preserved.
    #[error("schema violation: {reason}")]
    SchemaViolation { reason: ParseError, raw: String },

    /// The agent loop spent its iteration budget without a final answer.
    #[error("agent gave up after {iterations} iterations")]
    IterationLimitExceeded {
        iterations: usize,
        partial: Option<String>,
    },

    /// A model call inside the agent loop failed on the given iteration.
    #[error("agent iteration {iteration} failed: {source}")]
    AgentStep {
        iteration: usize,
        #[source]
        source: Box<PipelineError>,
    },

    /// A required configuration value is absent.
    #[error("missing configuration value: {0}")]
    MissingConfig(&'static str),

    /// Execution was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Walk through stage, branch, agent and stream wrappers to the
    /// underlying failure.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::StageFailed { source, .. }
            | PipelineError::BranchFailed { source, .. }
            | PipelineError::AgentStep { source, .. }
            | PipelineError::StreamInterrupted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
