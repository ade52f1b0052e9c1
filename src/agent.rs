//! Bounded tool-calling agent loop.
//!
//! Each iteration sends the conversation so far to the model, reads back
//! either a final answer or tool requests, runs the tools through the
//! [`ToolRegistry`], and appends everything to the transcript. The loop is
//! strictly sequential within a run and stops at `Done` or, once the
//! iteration budget is spent, at `Exhausted`.
//!
//! ```text
//!   Thinking ──model reply is final──► Done
//!      │  ▲
//!  tool │  │ results appended,
//! calls ▼  │ iterations += 1
//!    Acting ──iterations == max──► Exhausted
//! ```
//!
//! What happens at `Exhausted` is the caller's choice, made explicitly with
//! [`ExhaustionPolicy`]; there is no default.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    backend::{ChatMessage, LlmResponse, ToolCall},
    clean::strip_tagged,
    error::Result,
    events::{emit, Event},
    exec_ctx::ExecCtx,
    model::ChatModel,
    output_parser::{self, extract},
    stage::{BoxFut, Stage},
    tool::{ToolRegistry, ToolStatus},
    PipelineError,
};

/// Name of the pseudo-tool a model uses to finish in structured mode.
pub const FINAL_ANSWER: &str = "final_answer";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// What to do when the iteration budget runs out without a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Return [`AgentOutcome::Exhausted`] with the best partial answer.
    ReturnPartial,
    /// Fail with [`PipelineError::IterationLimitExceeded`].
    Fail,
}

/// How tool requests travel between the model and the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCallMode {
    /// The model replies with JSON `{"action": ..., "action_input": ...}`
    /// objects described in the system instructions. Works with any model.
    #[default]
    Structured,
    /// Tools are advertised through the backend's function-calling API.
    Native,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    Model {
        text: String,
    },
    ToolCall {
        id: String,
        tool: String,
        input: String,
    },
    ToolResult {
        id: String,
        tool: String,
        output: String,
        status: ToolStatus,
    },
}

/// Where a run is in the think/act cycle. The loop dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Thinking,
    Acting,
    Done,
    Exhausted,
}

/// Per-run state. Created fresh for every run and never shared.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub transcript: Vec<Turn>,
    /// Completed tool cycles.
    pub iterations: usize,
    pub phase: Phase,
}

impl AgentState {
    fn new() -> Self {
        Self {
            transcript: Vec::new(),
            iterations: 0,
            phase: Phase::Thinking,
        }
    }

    /// Best answer available without a final reply: the last model text that
    /// was not a tool request, else the last tool output.
    pub fn partial_answer(&self) -> Option<String> {
        let commentary = self.transcript.iter().rev().find_map(|turn| match turn {
            Turn::Model { text } => {
                let cleaned = strip_tagged(text, "<think>", "</think>");
                (!cleaned.is_empty() && parse_actions(&cleaned).is_none()).then_some(cleaned)
            }
            _ => None,
        });
        commentary.or_else(|| {
            self.transcript.iter().rev().find_map(|turn| match turn {
                Turn::ToolResult { output, .. } => Some(output.clone()),
                _ => None,
            })
        })
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Done {
        answer: String,
        transcript: Vec<Turn>,
        iterations: usize,
    },
    Exhausted {
        partial_answer: Option<String>,
        transcript: Vec<Turn>,
        iterations: usize,
    },
}

impl AgentOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, AgentOutcome::Done { .. })
    }

    /// The final answer, or the partial one after exhaustion.
    pub fn answer(&self) -> Option<&str> {
        match self {
            AgentOutcome::Done { answer, .. } => Some(answer),
            AgentOutcome::Exhausted { partial_answer, .. } => partial_answer.as_deref(),
        }
    }

    /// The terminal phase: [`Phase::Done`] or [`Phase::Exhausted`].
    pub fn phase(&self) -> Phase {
        match self {
            AgentOutcome::Done { .. } => Phase::Done,
            AgentOutcome::Exhausted { .. } => Phase::Exhausted,
        }
    }

    pub fn transcript(&self) -> &[Turn] {
        match self {
            AgentOutcome::Done { transcript, .. } | AgentOutcome::Exhausted { transcript, .. } => {
                transcript
            }
        }
    }

    pub fn iterations(&self) -> usize {
        match self {
            AgentOutcome::Done { iterations, .. } | AgentOutcome::Exhausted { iterations, .. } => {
                *iterations
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Action {
    action: String,
    #[serde(default)]
    action_input: Value,
}

impl Action {
    fn input(&self) -> String {
        match &self.action_input {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Extract structured actions from a reply, if it holds any.
///
/// Fenced blocks come first, then a bare top-level array, so a batch of
/// calls is never reduced to its last object.
fn parse_actions(text: &str) -> Option<Vec<Action>> {
    let fenced = extract::fenced_blocks(text).into_iter().map(|(_, body)| body);
    let mut regions = fenced
        .chain(extract::last_balanced_array(text))
        .chain(extract::candidates(text));
    regions.find_map(|candidate| {
        match output_parser::decode(candidate)? {
            Value::Object(map) => {
                serde_json::from_value::<Action>(Value::Object(map)).ok().map(|a| vec![a])
            }
            Value::Array(items) if !items.is_empty() => {
                serde_json::from_value::<Vec<Action>>(Value::Array(items)).ok()
            }
            _ => None,
        }
    })
}

enum Decision {
    Final(String),
    Calls(Vec<ToolCall>),
}

/// The agent loop. Immutable once built; each [`run`](Self::run) owns its state.
///
/// # Example
///
/// ```
/// use llm_runnables::agent::{AgentLoop, ExhaustionPolicy};
/// use llm_runnables::model::ChatModel;
/// use llm_runnables::tool::{FnTool, ToolRegistry};
///
/// let tools = ToolRegistry::new()
///     .with(FnTool::new("echo", "Repeats the input", |s: &str| Ok(s.to_string())))
///     .unwrap();
/// let agent = AgentLoop::new(ChatModel::new("deepseek-chat"), tools, 5, ExhaustionPolicy::ReturnPartial)
///     .with_system_prompt("You are a terse assistant.");
/// assert_eq!(agent.max_iterations(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct AgentLoop {
    name: String,
    model: ChatModel,
    registry: ToolRegistry,
    max_iterations: usize,
    policy: ExhaustionPolicy,
    mode: ToolCallMode,
    system_prompt: Option<String>,
}

impl AgentLoop {
    pub fn new(
        model: ChatModel,
        registry: ToolRegistry,
        max_iterations: usize,
        policy: ExhaustionPolicy,
    ) -> Self {
        Self {
            name: "agent".to_string(),
            model,
            registry,
            max_iterations,
            policy,
            mode: ToolCallMode::default(),
            system_prompt: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: ToolCallMode) -> Self {
        self.mode = mode;
        self
    }

    /// Persona text placed before the tool instructions.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// The system message sent on every iteration.
    pub fn instructions(&self) -> String {
        let persona = self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        match self.mode {
            ToolCallMode::Structured => format!(
                "{persona}\n\n\
                 You have access to the following tools:\n\n\
                 {tools}\n\n\
                 To use a tool, reply with only a JSON object:\n\
                 {{\"action\": \"<tool name>\", \"action_input\": \"<input string>\"}}\n\
                 To use several tools at once, reply with a JSON array of such objects.\n\
                 Tool results come back as observations.\n\
                 When you know the answer, or when none of the tools fits the request, \
                 answer directly with:\n\
                 {{\"action\": \"{FINAL_ANSWER}\", \"action_input\": \"<your answer>\"}}",
                tools = self.registry.describe(),
            ),
            ToolCallMode::Native => format!(
                "{persona}\n\nUse a tool only when one fits the request; \
                 when none does, answer directly."
            ),
        }
    }

    fn messages(&self, input: &str, transcript: &[Turn]) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.instructions()), ChatMessage::user(input)];
        for turn in transcript {
            match turn {
                Turn::Model { text } => messages.push(ChatMessage::assistant(text.clone())),
                Turn::ToolCall { id, tool, input } => {
                    if self.mode == ToolCallMode::Native {
                        if let Some(last) = messages.last_mut() {
                            last.tool_calls.push(ToolCall {
                                id: id.clone(),
                                name: tool.clone(),
                                input: input.clone(),
                            });
                        }
                    }
                }
                Turn::ToolResult { id, tool, output, .. } => messages.push(match self.mode {
                    ToolCallMode::Native => ChatMessage::tool_result(id.clone(), output.clone()),
                    ToolCallMode::Structured => {
                        ChatMessage::user(format!("Observation from {tool}: {output}"))
                    }
                }),
            }
        }
        messages
    }

    fn decide(&self, response: &LlmResponse, iteration: usize) -> Decision {
        let text = strip_tagged(&response.text, "<think>", "</think>");
        match self.mode {
            ToolCallMode::Native if !response.tool_calls.is_empty() => {
                Decision::Calls(response.tool_calls.clone())
            }
            ToolCallMode::Native => Decision::Final(text),
            ToolCallMode::Structured => match parse_actions(&text) {
                None => Decision::Final(text),
                Some(actions) => match actions.iter().find(|a| a.action == FINAL_ANSWER) {
                    Some(done) => Decision::Final(done.input()),
                    None => Decision::Calls(
                        actions
                            .iter()
                            .enumerate()
                            .map(|(i, a)| ToolCall {
                                id: format!("call_{iteration}_{i}"),
                                name: a.action.clone(),
                                input: a.input(),
                            })
                            .collect(),
                    ),
                },
            },
        }
    }

    /// Run the loop on `input` until `Done` or `Exhausted`.
    pub async fn run(&self, ctx: &ExecCtx, input: &str) -> Result<AgentOutcome> {
        emit(
            &ctx.event_handler,
            Event::StageStart {
                name: self.name.clone(),
                kind: "agent",
            },
        );
        let result = self.drive(ctx, input).await;
        emit(
            &ctx.event_handler,
            Event::StageEnd {
                name: self.name.clone(),
                ok: result.is_ok(),
            },
        );
        result
    }

    async fn drive(&self, ctx: &ExecCtx, input: &str) -> Result<AgentOutcome> {
        let mut state = AgentState::new();
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut answer = String::new();

        loop {
            match state.phase {
                Phase::Thinking => {
                    ctx.check_cancelled()?;
                    if state.iterations >= self.max_iterations {
                        state.phase = Phase::Exhausted;
                        continue;
                    }

                    let iteration = state.iterations;
                    emit(
                        &ctx.event_handler,
                        Event::AgentIteration {
                            iteration,
                            max_iterations: self.max_iterations,
                        },
                    );
                    debug!(agent = %self.name, iteration, max = self.max_iterations, "Agent thinking");

                    let mut request = self.model.request(self.messages(input, &state.transcript));
                    if self.mode == ToolCallMode::Native {
                        request.tools = self.registry.specs();
                    }
                    let response = self
                        .model
                        .complete(ctx, &request)
                        .await
                        .map_err(|e| PipelineError::AgentStep {
                            iteration,
                            source: Box::new(e),
                        })?;
                    state.transcript.push(Turn::Model {
                        text: response.text.clone(),
                    });

                    match self.decide(&response, iteration) {
                        Decision::Final(text) => {
                            answer = text;
                            state.phase = Phase::Done;
                        }
                        Decision::Calls(calls) => {
                            pending = calls;
                            state.phase = Phase::Acting;
                        }
                    }
                }
                Phase::Acting => {
                    for call in pending.drain(..) {
                        ctx.check_cancelled()?;
                        emit(
                            &ctx.event_handler,
                            Event::ToolInvoked {
                                tool: call.name.clone(),
                                input: call.input.clone(),
                            },
                        );
                        state.transcript.push(Turn::ToolCall {
                            id: call.id.clone(),
                            tool: call.name.clone(),
                            input: call.input.clone(),
                        });

                        let result = self.registry.invoke(&call.name, &call.input).await;

                        emit(
                            &ctx.event_handler,
                            Event::ToolFinished {
                                tool: result.tool.clone(),
                                status: result.status,
                            },
                        );
                        state.transcript.push(Turn::ToolResult {
                            id: call.id,
                            tool: result.tool,
                            output: result.output,
                            status: result.status,
                        });
                    }
                    state.iterations += 1;
                    state.phase = Phase::Thinking;
                }
                Phase::Done => {
                    info!(agent = %self.name, iterations = state.iterations, "Agent finished");
                    return Ok(AgentOutcome::Done {
                        answer,
                        transcript: state.transcript,
                        iterations: state.iterations,
                    });
                }
                Phase::Exhausted => return self.exhaust(state),
            }
        }
    }

    fn exhaust(&self, state: AgentState) -> Result<AgentOutcome> {
        let partial = state.partial_answer();
        warn!(
            agent = %self.name,
            iterations = state.iterations,
            has_partial = partial.is_some(),
            "Agent iteration budget exhausted"
        );
        match self.policy {
            ExhaustionPolicy::ReturnPartial => Ok(AgentOutcome::Exhausted {
                partial_answer: partial,
                transcript: state.transcript,
                iterations: state.iterations,
            }),
            ExhaustionPolicy::Fail => Err(PipelineError::IterationLimitExceeded {
                iterations: state.iterations,
                partial,
            }),
        }
    }
}

impl Stage<String> for AgentLoop {
    type Output = AgentOutcome;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, input: String) -> BoxFut<'a, Result<AgentOutcome>>
    where
        String: 'a,
    {
        Box::pin(async move { self.run(ctx, &input).await })
    }
}
