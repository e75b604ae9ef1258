//! Per-stage task execution.
//!
//! A [`TaskAgent`] executes one stage in isolation: it renders the
//! stage prompt, optionally drives a bounded tool-call loop, streams
//! text, and returns a [`TaskOutcome`]. It is stateless between
//! invocations and never mutates shared state directly; the engine
//! merges whatever it returns.

use crate::cancellation::AbortSignal;
use crate::cost::{CostTracker, ModelRouter, PricingTable};
use crate::errors::EngineError;
use crate::provider::{
    ChatMessage, ChunkCallback, ModelProvider, ModelReply, ModelRequest, TokenUsage, Tool,
    ToolRegistry, ToolSpec,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::semaphore::CallGate;
use crate::workflow::StageDef;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rough tokens-per-character ratio for pre-call reservations.
const CHARS_PER_TOKEN: usize = 4;
/// Baseline input tokens for scaffolding around the rendered prompt.
const BASE_INPUT_TOKENS: u32 = 500;
/// Default output cap when a stage declares none.
const DEFAULT_OUTPUT_TOKENS: u32 = 1_024;

/// Result of one task agent invocation: a tagged union, never a thrown
/// error. `fatal` marks failures that must halt the entire run.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The stage produced output.
    Success {
        /// The stage's text output.
        content: String,
        /// Token accounting across all calls made for the stage.
        usage: TokenUsage,
        /// Actual USD cost, already finalized against the tracker.
        cost_usd: f64,
    },
    /// The stage failed.
    Error {
        /// Human-readable failure cause.
        cause: String,
        /// True for budget exhaustion or cancellation; false for
        /// stage-local failures (retries exhausted, bad responses).
        fatal: bool,
    },
}

impl TaskOutcome {
    /// Returns true for the success variant.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Executes single stages against the injected provider and tools.
pub struct TaskAgent {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    pricing: Arc<PricingTable>,
    router: ModelRouter,
    gate: CallGate,
    default_model: String,
    max_tool_steps: u32,
}

impl std::fmt::Debug for TaskAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskAgent")
            .field("default_model", &self.default_model)
            .field("max_tool_steps", &self.max_tool_steps)
            .finish()
    }
}

impl TaskAgent {
    /// Creates an agent.
    #[must_use]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        pricing: Arc<PricingTable>,
        router: ModelRouter,
        gate: CallGate,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            registry,
            pricing,
            router,
            gate,
            default_model: default_model.into(),
            max_tool_steps: 5,
        }
    }

    /// Sets the bound on tool-call rounds per stage.
    #[must_use]
    pub fn with_max_tool_steps(mut self, steps: u32) -> Self {
        self.max_tool_steps = steps;
        self
    }

    /// The call gate this agent schedules its model calls under.
    #[must_use]
    pub fn gate(&self) -> &CallGate {
        &self.gate
    }

    /// Executes one stage.
    ///
    /// `prior` is a read-only snapshot of upstream stage outputs taken
    /// at launch time; `on_chunk` receives streamed text for stages
    /// without tools.
    pub async fn execute(
        &self,
        stage: &StageDef,
        inputs: &HashMap<String, serde_json::Value>,
        prior: &HashMap<String, String>,
        tracker: &CostTracker,
        budget: f64,
        abort: &AbortSignal,
        on_chunk: ChunkCallback<'_>,
    ) -> TaskOutcome {
        if abort.is_aborted() {
            return TaskOutcome::Error {
                cause: format!(
                    "run cancelled: {}",
                    abort.reason().unwrap_or_else(|| "aborted".to_string())
                ),
                fatal: true,
            };
        }
        if let Err(error) = tracker.check_budget(budget) {
            return self.outcome_from_error(error, abort);
        }

        let prompt = match &stage.prompt {
            Some(template) => render_template(template, inputs, prior, &stage.depends_on),
            None => {
                return TaskOutcome::Error {
                    cause: format!("stage '{}' has no prompt", stage.name),
                    fatal: false,
                }
            }
        };
        let model = self
            .router
            .route(stage.model.as_deref().unwrap_or(&self.default_model));

        let estimated_usage = TokenUsage {
            input_tokens: BASE_INPUT_TOKENS + (prompt.len() / CHARS_PER_TOKEN) as u32,
            output_tokens: stage.max_tokens.unwrap_or(DEFAULT_OUTPUT_TOKENS),
        };
        let estimate = self.pricing.cost(&model, estimated_usage);
        let reservation = match tracker.reserve(estimate, budget) {
            Ok(reservation) => reservation,
            Err(error) => return self.outcome_from_error(error, abort),
        };

        let tools = self.registry.resolve(&stage.tools);
        let request = ModelRequest {
            model: model.clone(),
            system_prompt: None,
            messages: vec![ChatMessage::user(prompt)],
            temperature: stage.temperature,
            max_tokens: stage.max_tokens,
            tools: Vec::new(),
        };

        let result = if tools.is_empty() {
            self.streamed_call(request, abort, on_chunk).await
        } else {
            debug!(stage = %stage.name, tools = tools.len(), "running agentic tool loop");
            self.tool_loop(request, &tools, abort).await
        };

        match result {
            Ok((content, usage)) => {
                let cost_usd = self.pricing.cost(&model, usage);
                tracker.finalize(reservation, cost_usd);
                TaskOutcome::Success {
                    content,
                    usage,
                    cost_usd,
                }
            }
            Err(error) => {
                // Release the hold; nothing was spent on a failed call.
                tracker.finalize(reservation, 0.0);
                self.outcome_from_error(error, abort)
            }
        }
    }

    /// Plain streaming call for stages without tools.
    async fn streamed_call(
        &self,
        request: ModelRequest,
        abort: &AbortSignal,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(String, TokenUsage), EngineError> {
        let outcome = with_retry(&RetryPolicy::llm_rate_limit(), abort, || {
            let request = request.clone();
            let provider = self.provider.clone();
            let gate = self.gate.clone();
            async move { gate.run(|| provider.invoke(request, Some(on_chunk))).await }
        })
        .await?;
        let reply = outcome.value;
        Ok((reply.content, reply.usage))
    }

    /// Bounded agentic loop: invoke with tools attached, execute the
    /// requested calls, feed results back, until the model answers in
    /// text or the step bound is reached.
    async fn tool_loop(
        &self,
        base: ModelRequest,
        tools: &HashMap<String, Arc<dyn Tool>>,
        abort: &AbortSignal,
    ) -> Result<(String, TokenUsage), EngineError> {
        let specs: Vec<ToolSpec> = tools.values().map(|t| t.spec()).collect();
        let mut messages = base.messages.clone();
        let mut usage = TokenUsage::default();
        let mut content = String::new();

        for step in 0..self.max_tool_steps {
            let request = ModelRequest {
                messages: messages.clone(),
                tools: specs.clone(),
                ..base.clone()
            };
            let reply: ModelReply = with_retry(&RetryPolicy::llm_server_error(), abort, || {
                let request = request.clone();
                let provider = self.provider.clone();
                let gate = self.gate.clone();
                async move { gate.run(|| provider.invoke(request, None)).await }
            })
            .await?
            .value;

            usage = usage.add(reply.usage);
            content = reply.content.clone();
            if reply.tool_calls.is_empty() {
                return Ok((content, usage));
            }

            messages.push(ChatMessage::assistant(
                serde_json::to_string(&reply.tool_calls).unwrap_or_default(),
            ));
            for call in reply.tool_calls {
                let rendered = match tools.get(&call.name) {
                    Some(tool) => self.run_tool(tool, &call.name, call.arguments, abort).await,
                    None => {
                        warn!(tool = %call.name, "model requested an unresolved tool");
                        format!("tool '{}' is not available", call.name)
                    }
                };
                messages.push(ChatMessage::tool(rendered));
            }
            debug!(step, "tool round complete");
        }

        // Step bound reached; the last text reply stands.
        Ok((content, usage))
    }

    async fn run_tool(
        &self,
        tool: &Arc<dyn Tool>,
        name: &str,
        arguments: serde_json::Value,
        abort: &AbortSignal,
    ) -> String {
        let result = with_retry(&RetryPolicy::tool_call(), abort, || {
            let tool = tool.clone();
            let arguments = arguments.clone();
            async move { tool.call(arguments).await }
        })
        .await;

        match result {
            Ok(outcome) => format!("{name}: {}", outcome.value),
            Err(error) => format!("{name} failed: {error}"),
        }
    }

    fn outcome_from_error(&self, error: EngineError, abort: &AbortSignal) -> TaskOutcome {
        let fatal = error.is_fatal() || abort.is_aborted();
        TaskOutcome::Error {
            cause: error.to_string(),
            fatal,
        }
    }
}

/// Renders `{name}`-style placeholders from run inputs and from prior
/// outputs of the stage's declared dependencies.
///
/// Array values are joined with ", "; unresolved placeholders are left
/// verbatim.
#[must_use]
pub fn render_template(
    template: &str,
    inputs: &HashMap<String, serde_json::Value>,
    prior: &HashMap<String, String>,
    depends_on: &[String],
) -> String {
    let mut rendered = template.to_string();
    for (key, value) in inputs {
        rendered = rendered.replace(&format!("{{{key}}}"), &render_value(value));
    }
    for dep in depends_on {
        if let Some(output) = prior.get(dep) {
            rendered = rendered.replace(&format!("{{{dep}}}"), output);
        }
    }
    rendered
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
