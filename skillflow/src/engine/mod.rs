//! The workflow execution engine.
//!
//! [`PipelineEngine::run`] takes a validated [`WorkflowDefinition`] and
//! drives it to a settled [`RunResult`]: stages are grouped into
//! dependency levels, each level's agent stages run concurrently under
//! a shared call gate, and a shared [`CostTracker`] enforces the run
//! budget through the reserve/finalize protocol.
//!
//! Stage failures are data, not control flow. A failed stage marks its
//! transitive dependents as skipped and the run continues with whatever
//! is still reachable; only budget exhaustion and cancellation halt the
//! run, and even then the engine returns a structured partial result
//! rather than an error.

pub mod dag;

#[cfg(test)]
mod integration_tests;

use crate::agent::{TaskAgent, TaskOutcome};
use crate::cancellation::AbortSignal;
use crate::cost::{CostTracker, ModelRouter, PricingTable, MAX_SUB_WORKFLOW_DEPTH};
use crate::errors::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::provider::{ModelProvider, ToolRegistry};
use crate::semaphore::CallGate;
use crate::verification::{ClaimVerifier, VerificationReport, VerifierControls};
use crate::workflow::{StageDef, WorkflowDefinition};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default bound on concurrent model calls across a run.
const DEFAULT_MAX_CONCURRENT_CALLS: usize = 4;

/// Model used when neither a stage nor the engine overrides it.
const DEFAULT_MODEL: &str = "claude-sonnet-4";

/// The settled result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Unique id for this run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// The workflow name.
    pub workflow: String,
    /// Output text of every completed stage, keyed by stage name.
    pub outputs: HashMap<String, String>,
    /// The primary output, when its stage completed.
    pub primary_output: Option<String>,
    /// Number of stages that completed.
    pub stages_completed: usize,
    /// Stages that ran and failed.
    pub failed_stages: Vec<String>,
    /// Stages that never ran because an upstream stage failed or the
    /// run stopped early.
    pub skipped_stages: Vec<String>,
    /// Actual spend across the run in USD.
    pub total_cost_usd: f64,
    /// Number of budgeted model calls made during the run, claim
    /// extraction included.
    pub total_calls: u64,
    /// True when any stage failed or was skipped.
    pub partial: bool,
    /// Claim verification report, when the workflow had a verify stage
    /// that completed.
    pub verification: Option<VerificationReport>,
}

/// How a settled stage ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageState {
    Done,
    Failed,
    Skipped,
}

/// Accumulated state of one (possibly nested) workflow execution.
struct StageRun {
    outputs: HashMap<String, String>,
    completed: usize,
    failed: Vec<String>,
    skipped: Vec<String>,
    partial: bool,
    /// True when the run stopped on a fatal error (budget exhaustion).
    /// Cancellation also stops the run but travels through the shared
    /// abort signal instead.
    halted: bool,
    verification: Option<VerificationReport>,
}

/// Executes workflows against an injected provider and tool registry.
///
/// The engine holds no per-run state; one engine instance can serve
/// many concurrent [`run`](Self::run) calls.
pub struct PipelineEngine {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    pricing: Arc<PricingTable>,
    router: ModelRouter,
    events: EventBus,
    max_concurrent_calls: usize,
    max_tool_steps: u32,
    default_model: String,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("default_model", &self.default_model)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .finish()
    }
}

impl PipelineEngine {
    /// Creates an engine with default pricing, routing, and limits.
    #[must_use]
    pub fn new(provider: Arc<dyn ModelProvider>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            registry,
            pricing: Arc::new(PricingTable::with_defaults()),
            router: ModelRouter::default(),
            events: EventBus::new(),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_tool_steps: 5,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Replaces the pricing table.
    #[must_use]
    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = pricing;
        self
    }

    /// Replaces the model router.
    #[must_use]
    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = router;
        self
    }

    /// Sets the model used when a stage declares none.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Sets the bound on concurrent model calls.
    #[must_use]
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    /// Sets the bound on tool-call rounds per stage.
    #[must_use]
    pub fn with_max_tool_steps(mut self, steps: u32) -> Self {
        self.max_tool_steps = steps;
        self
    }

    /// The engine's event bus, for subscribing sinks.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Runs `workflow` to completion or to its first fatal stop.
    ///
    /// Returns `Err` only for conditions detected before any stage
    /// runs: structural validation, dependency cycles, nesting depth,
    /// or missing required tools. Once execution starts, failures are
    /// reported through [`RunResult`] with `partial` set.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`], [`EngineError::Cycle`], or
    /// [`EngineError::ToolsUnavailable`].
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        inputs: &HashMap<String, serde_json::Value>,
        budget: f64,
        abort: Arc<AbortSignal>,
    ) -> Result<RunResult, EngineError> {
        preflight(workflow, 0)?;
        self.check_tools(workflow)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, workflow = %workflow.name, budget, "starting run");

        let tracker = Arc::new(CostTracker::new());
        let gate = CallGate::new(self.max_concurrent_calls)?;
        let agent = Arc::new(
            TaskAgent::new(
                self.provider.clone(),
                self.registry.clone(),
                self.pricing.clone(),
                self.router.clone(),
                gate,
                self.default_model.clone(),
            )
            .with_max_tool_steps(self.max_tool_steps),
        );

        let run = self
            .run_stages(workflow, inputs, budget, &abort, &tracker, &agent, 0)
            .await?;

        let total_cost_usd = tracker.spent();
        let partial = run.partial || abort.is_aborted();
        self.events.emit(&EngineEvent::PipelineComplete {
            total_cost_usd,
            partial,
            report: run.verification.clone(),
        });
        info!(
            run_id = %run_id,
            completed = run.completed,
            failed = run.failed.len(),
            skipped = run.skipped.len(),
            cost = total_cost_usd,
            "run settled"
        );

        Ok(RunResult {
            run_id,
            started_at,
            workflow: workflow.name.clone(),
            primary_output: run.outputs.get(&workflow.output.primary).cloned(),
            outputs: run.outputs,
            stages_completed: run.completed,
            failed_stages: run.failed,
            skipped_stages: run.skipped,
            total_cost_usd,
            total_calls: tracker.call_count(),
            partial,
            verification: run.verification,
        })
    }

    /// Gates the run on required tool groups; optional groups only emit
    /// an advisory event.
    fn check_tools(&self, workflow: &WorkflowDefinition) -> Result<(), EngineError> {
        let missing: Vec<String> = workflow
            .tools_required
            .iter()
            .filter(|name| !self.registry.is_available(name))
            .cloned()
            .collect();
        for name in &missing {
            self.events.emit(&EngineEvent::ToolUnavailable {
                name: name.clone(),
                required: true,
            });
        }
        if !missing.is_empty() {
            return Err(EngineError::ToolsUnavailable { missing });
        }

        for name in &workflow.tools_optional {
            if !self.registry.is_available(name) {
                warn!(group = %name, "optional tool group unavailable, continuing without it");
                self.events.emit(&EngineEvent::ToolUnavailable {
                    name: name.clone(),
                    required: false,
                });
            }
        }
        Ok(())
    }

    /// Executes one workflow's levels, recursing into sub-workflows.
    ///
    /// Boxed because the future is recursive.
    #[allow(clippy::too_many_arguments)]
    fn run_stages<'a>(
        &'a self,
        workflow: &'a WorkflowDefinition,
        inputs: &'a HashMap<String, serde_json::Value>,
        budget: f64,
        abort: &'a Arc<AbortSignal>,
        tracker: &'a Arc<CostTracker>,
        agent: &'a Arc<TaskAgent>,
        depth: usize,
    ) -> BoxFuture<'a, Result<StageRun, EngineError>> {
        Box::pin(async move {
            let levels = dag::execution_levels(workflow)?;
            let total = workflow.stages.len();
            let mut next_index = 1usize;

            let mut run = StageRun {
                outputs: HashMap::new(),
                completed: 0,
                failed: Vec::new(),
                skipped: Vec::new(),
                partial: false,
                halted: false,
                verification: None,
            };
            let mut settled: HashMap<String, StageState> = HashMap::new();

            for level in levels {
                if run.halted || abort.is_aborted() {
                    break;
                }
                debug!(workflow = %workflow.name, depth, stages = level.len(), "starting level");

                let mut sub_stages: Vec<&StageDef> = Vec::new();
                let mut agent_stages: Vec<&StageDef> = Vec::new();
                for name in &level {
                    let Some(stage) = workflow.stage(name) else {
                        return Err(EngineError::Internal(format!(
                            "level references unknown stage '{name}'"
                        )));
                    };
                    let upstream_failed = stage.depends_on.iter().any(|dep| {
                        matches!(
                            settled.get(dep),
                            Some(StageState::Failed | StageState::Skipped)
                        )
                    });
                    if upstream_failed {
                        settled.insert(stage.name.clone(), StageState::Skipped);
                        run.skipped.push(stage.name.clone());
                        run.partial = true;
                        next_index += 1;
                    } else if stage.sub_workflow.is_some() {
                        sub_stages.push(stage);
                    } else {
                        agent_stages.push(stage);
                    }
                }

                // Snapshot before anything in this level runs: stages
                // of one level never see each other's output, whether
                // the sibling is an agent stage or a sub-workflow.
                let prior = Arc::new(run.outputs.clone());

                for stage in sub_stages {
                    if run.halted || abort.is_aborted() {
                        settled.insert(stage.name.clone(), StageState::Skipped);
                        run.skipped.push(stage.name.clone());
                        run.partial = true;
                        continue;
                    }
                    let index = next_index;
                    next_index += 1;
                    self.run_sub_workflow(stage, inputs, budget, abort, tracker, agent, depth, index, total, &mut run, &mut settled)
                        .await?;
                }

                let mut handles: Vec<(String, JoinHandle<(TaskOutcome, u64)>)> = Vec::new();
                for stage in &agent_stages {
                    let index = next_index;
                    next_index += 1;
                    if run.halted || abort.is_aborted() {
                        settled.insert(stage.name.clone(), StageState::Skipped);
                        run.skipped.push(stage.name.clone());
                        run.partial = true;
                        continue;
                    }
                    let model = self
                        .router
                        .route(stage.model.as_deref().unwrap_or(&self.default_model));
                    self.events.emit(&EngineEvent::StageStart {
                        name: stage.name.clone(),
                        model,
                        index,
                        total,
                    });

                    let agent = agent.clone();
                    let stage = (*stage).clone();
                    let inputs = inputs.clone();
                    let prior = prior.clone();
                    let tracker = tracker.clone();
                    let abort = abort.clone();
                    let events = self.events.clone();
                    let name = stage.name.clone();
                    handles.push((
                        name.clone(),
                        tokio::spawn(async move {
                            let started = Instant::now();
                            let stream_name = name.clone();
                            let on_chunk = move |chunk: &str| {
                                events.emit(&EngineEvent::StageStream {
                                    name: stream_name.clone(),
                                    chunk: chunk.to_string(),
                                });
                            };
                            let outcome = agent
                                .execute(&stage, &inputs, &prior, &tracker, budget, &abort, &on_chunk)
                                .await;
                            #[allow(clippy::cast_possible_truncation)]
                            let duration_ms = started.elapsed().as_millis() as u64;
                            (outcome, duration_ms)
                        }),
                    ));
                }

                // Join barrier: the level settles as a unit.
                let mut verify_pending: Vec<String> = Vec::new();
                for (name, handle) in handles {
                    let (outcome, duration_ms) = match handle.await {
                        Ok(settled_outcome) => settled_outcome,
                        Err(join_err) => {
                            warn!(stage = %name, error = %join_err, "stage task panicked");
                            (
                                TaskOutcome::Error {
                                    cause: format!("stage task failed: {join_err}"),
                                    fatal: false,
                                },
                                0,
                            )
                        }
                    };
                    match outcome {
                        TaskOutcome::Success {
                            content, cost_usd, ..
                        } => {
                            settled.insert(name.clone(), StageState::Done);
                            run.completed += 1;
                            self.events.emit(&EngineEvent::StageComplete {
                                name: name.clone(),
                                cost_usd,
                                duration_ms,
                            });
                            if workflow.stage(&name).is_some_and(StageDef::is_verify) {
                                verify_pending.push(name.clone());
                            }
                            run.outputs.insert(name, content);
                        }
                        TaskOutcome::Error { cause, fatal } => {
                            warn!(stage = %name, %cause, fatal, "stage failed");
                            settled.insert(name.clone(), StageState::Failed);
                            run.failed.push(name.clone());
                            run.partial = true;
                            self.events.emit(&EngineEvent::StageError { name });
                            if fatal {
                                run.halted = true;
                            }
                        }
                    }
                }

                // Verification waits for the whole level to settle so
                // the evidence set includes every completed sibling.
                for name in verify_pending {
                    let Some(stage) = workflow.stage(&name) else {
                        continue;
                    };
                    let Some(content) = run.outputs.get(&name).cloned() else {
                        continue;
                    };
                    self.verify_stage(&name, &content, stage, budget, abort, tracker, agent, &mut run)
                        .await;
                }
            }

            // Everything that never settled was cut off by a failure,
            // a fatal stop, or cancellation.
            for stage in &workflow.stages {
                if !settled.contains_key(&stage.name) {
                    run.skipped.push(stage.name.clone());
                    run.partial = true;
                }
            }

            Ok(run)
        })
    }

    /// Runs one nested sub-workflow stage inline on the shared tracker
    /// and abort signal.
    #[allow(clippy::too_many_arguments)]
    async fn run_sub_workflow(
        &self,
        stage: &StageDef,
        inputs: &HashMap<String, serde_json::Value>,
        budget: f64,
        abort: &Arc<AbortSignal>,
        tracker: &Arc<CostTracker>,
        agent: &Arc<TaskAgent>,
        depth: usize,
        index: usize,
        total: usize,
        run: &mut StageRun,
        settled: &mut HashMap<String, StageState>,
    ) -> Result<(), EngineError> {
        let Some(nested) = &stage.sub_workflow else {
            return Err(EngineError::Internal(format!(
                "stage '{}' routed as sub-workflow without one",
                stage.name
            )));
        };

        self.events.emit(&EngineEvent::StageStart {
            name: stage.name.clone(),
            model: String::new(),
            index,
            total,
        });
        let started = Instant::now();
        let spent_before = tracker.spent();

        // The nested workflow sees the run inputs plus the outputs of
        // this stage's declared dependencies.
        let mut nested_inputs = inputs.clone();
        for dep in &stage.depends_on {
            if let Some(output) = run.outputs.get(dep) {
                nested_inputs.insert(dep.clone(), serde_json::Value::String(output.clone()));
            }
        }

        let nested_run = self
            .run_stages(nested, &nested_inputs, budget, abort, tracker, agent, depth + 1)
            .await?;
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        if nested_run.halted {
            // Budget exhaustion inside a sub-workflow is fatal to the
            // whole run, same as at the top level.
            settled.insert(stage.name.clone(), StageState::Failed);
            run.failed.push(stage.name.clone());
            run.partial = true;
            run.halted = true;
            self.events.emit(&EngineEvent::StageError {
                name: stage.name.clone(),
            });
            return Ok(());
        }

        if run.verification.is_none() {
            run.verification = nested_run.verification;
        }

        if nested_run.partial {
            warn!(stage = %stage.name, failed = nested_run.failed.len(), "sub-workflow was partial");
            settled.insert(stage.name.clone(), StageState::Failed);
            run.failed.push(stage.name.clone());
            run.partial = true;
            self.events.emit(&EngineEvent::StageError {
                name: stage.name.clone(),
            });
            return Ok(());
        }

        let output = nested_run
            .outputs
            .get(&nested.output.primary)
            .cloned()
            .unwrap_or_default();
        settled.insert(stage.name.clone(), StageState::Done);
        run.completed += 1;
        run.outputs.insert(stage.name.clone(), output);
        self.events.emit(&EngineEvent::StageComplete {
            name: stage.name.clone(),
            cost_usd: tracker.spent() - spent_before,
            duration_ms,
        });
        Ok(())
    }

    /// Runs claim verification over a completed verify stage's output,
    /// using every other completed stage as source material. The
    /// extraction call draws on the same budget, gate, and abort signal
    /// as the run's stage calls.
    #[allow(clippy::too_many_arguments)]
    async fn verify_stage(
        &self,
        name: &str,
        content: &str,
        stage: &StageDef,
        budget: f64,
        abort: &Arc<AbortSignal>,
        tracker: &Arc<CostTracker>,
        agent: &Arc<TaskAgent>,
        run: &mut StageRun,
    ) {
        let sources: HashMap<String, String> = run
            .outputs
            .iter()
            .filter(|(stage_name, _)| stage_name.as_str() != name)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let model = self
            .router
            .route(stage.model.as_deref().unwrap_or(&self.default_model));
        let verifier =
            ClaimVerifier::new(self.provider.clone(), model).with_controls(VerifierControls {
                tracker: tracker.clone(),
                budget,
                pricing: self.pricing.clone(),
                gate: agent.gate().clone(),
                abort: abort.clone(),
            });
        let report = verifier.verify(content, &sources).await;
        debug!(
            stage = %name,
            claims = report.claims.len(),
            verified = report.verified,
            "verification finished"
        );
        self.events.emit(&EngineEvent::VerificationComplete {
            name: name.to_string(),
        });
        run.verification = Some(report);
    }
}

/// Static checks run before anything executes: structure, cycles, and
/// nesting depth, recursively through sub-workflows.
fn preflight(workflow: &WorkflowDefinition, depth: usize) -> Result<(), EngineError> {
    if depth > MAX_SUB_WORKFLOW_DEPTH {
        return Err(EngineError::Validation(format!(
            "sub-workflow nesting in '{}' exceeds depth {MAX_SUB_WORKFLOW_DEPTH}",
            workflow.name
        )));
    }
    workflow.validate()?;
    dag::validate_acyclic(workflow)?;
    for stage in &workflow.stages {
        if let Some(nested) = &stage.sub_workflow {
            preflight(nested, depth + 1)?;
        }
    }
    Ok(())
}
