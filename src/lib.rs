//! # LLM Runnables
//!
//! Composable building blocks for LLM workflows: typed stages wired into
//! chains and parallel groups, schema-driven structured output, stream
//! aggregation, and a bounded tool-calling agent loop.
//!
//! ## Core Concepts
//!
//! - **[`Stage`]**: object-safe trait for a typed transform `In -> Output`,
//!   invoked whole (`invoke`) or incrementally (`stream`).
//! - **[`Chain`]**: sequential composition via [`compose`] or
//!   [`StageExt::pipe`]; type-checked at build time, with failures reported
//!   at the failing stage's flat position.
//! - **[`ParallelGroup`]**: fan-out of one input to named branches, merged
//!   into a map; fail-fast.
//! - **[`StructuredParser`]**: schema-driven format instructions plus a
//!   lenient parser that keeps the raw text on failure.
//! - **[`StreamAggregator`]**: forwards fragments as they arrive, then
//!   parses the joined text; interruption is an error carrying the partial.
//! - **[`AgentLoop`]**: model, tools, transcript; ends `Done` or `Exhausted`.
//! - **[`ExecCtx`]**: shared HTTP client, backend, timeout, retry policy,
//!   cancellation, and event handler.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_runnables::{
//!     compose, config::Settings, output_parser::{Schema, StructuredParser},
//!     prompt::{vars, PromptTemplate}, Stage, StageExt,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env()?;
//!     let ctx = settings.exec_ctx()?;
//!
//!     let schema = Schema::builder()
//!         .field("names", "names of the people")
//!         .field("county", "county they live in")
//!         .build()?;
//!     let parser = StructuredParser::new(schema);
//!
//!     let prompt = PromptTemplate::new("people")
//!         .system("Answer the user's question.\n{format_instructions}")
//!         .user("{question}")
//!         .partial("format_instructions", parser.format_instructions());
//!
//!     let chain = compose(prompt, settings.chat_model()).pipe(parser);
//!     let result = chain
//!         .invoke(&ctx, vars([("question", "Which twins live in Kent?")]))
//!         .await?;
//!     println!("{}", result.to_value());
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod aggregate;
pub mod backend;
pub mod chain;
pub mod clean;
pub mod config;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod model;
pub mod output_parser;
pub mod parallel;
pub mod prompt;
pub mod stage;
pub mod tool;

pub use agent::{AgentLoop, AgentOutcome, AgentState, ExhaustionPolicy, Phase, ToolCallMode, Turn};
pub use aggregate::{stream_into, StreamAggregator};
pub use backend::{BackoffConfig, ChatMessage, MockBackend, OpenAiBackend, Role};
pub use chain::{compose, Chain};
pub use clean::{SplitList, StripReasoning};
pub use config::{LlmConfig, Settings};
pub use error::{PipelineError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use model::ChatModel;
pub use output_parser::{ParsedResult, Record, Schema, StrictParser, StructuredParser};
pub use parallel::ParallelGroup;
pub use prompt::{PromptTemplate, Vars};
pub use stage::{BoxFut, FnStage, Stage, StageExt};
pub use tool::{FnTool, Tool, ToolRegistry, ToolResult, ToolStatus};
