//! Event hooks for stage, tool, and agent lifecycles.
//!
//! Stages emit events when they start, produce tokens, and finish; the agent
//! loop adds iteration and tool events. Implement [`EventHandler`] to drive a
//! streaming UI or progress display. Structured logs go through `tracing`
//! independently of this channel.

use std::sync::Arc;

use crate::tool::ToolStatus;

/// Events emitted while runnables execute.
#[derive(Debug, Clone)]
pub enum Event {
    /// A stage has started executing.
    StageStart {
        /// Instance name of the stage.
        name: String,
        /// Stable type identifier (e.g. `"chat-model"`, `"agent"`).
        kind: &'static str,
    },
    /// A fragment arrived from a streaming model call.
    Token {
        /// Instance name of the stage producing this fragment.
        name: String,
        /// The fragment text.
        chunk: String,
    },
    /// A stage has finished executing.
    StageEnd {
        /// Instance name of the stage.
        name: String,
        /// Whether execution succeeded.
        ok: bool,
    },
    /// A transport-level retry is about to happen.
    TransportRetry {
        /// Instance name of the calling stage.
        name: String,
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this retry attempt in milliseconds.
        delay_ms: u64,
        /// Reason for the retry (error description).
        reason: String,
    },
    /// The agent is about to call the model for the given iteration.
    AgentIteration {
        /// Zero-based iteration number.
        iteration: usize,
        /// Configured iteration budget.
        max_iterations: usize,
    },
    /// The agent dispatched a tool call.
    ToolInvoked { tool: String, input: String },
    /// A tool call returned (successfully or not).
    ToolFinished { tool: String, status: ToolStatus },
}

/// Handler for lifecycle events.
///
/// This is entirely optional; every runnable works without one.
///
/// # Example
///
/// ```
/// use llm_runnables::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         if let Event::Token { chunk, .. } = event {
///             print!("{}", chunk);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when a runnable emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
