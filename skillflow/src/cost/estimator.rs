//! Pre-execution cost/time estimation and model routing.

use crate::cost::pricing::PricingTable;
use crate::engine::dag;
use crate::errors::EngineError;
use crate::provider::TokenUsage;
use crate::workflow::{StageDef, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Nesting ceiling for sub-workflow recursion.
///
/// Sub-workflow references are not cycle-checked across definitions, so
/// both the estimator and the engine stop descending past this depth.
pub const MAX_SUB_WORKFLOW_DEPTH: usize = 8;

/// Rough tokens-per-character ratio used before any model is called.
const CHARS_PER_TOKEN: usize = 4;
/// Assumed prior-output size fed in per declared dependency.
const TOKENS_PER_DEPENDENCY: u32 = 1_000;
/// Baseline input tokens for system prompt and scaffolding.
const BASE_INPUT_TOKENS: u32 = 500;
/// Default output cap when a stage declares none.
const DEFAULT_OUTPUT_TOKENS: u32 = 1_024;
/// Assumed wall time for one model call.
const CALL_DURATION_MS: u64 = 5_000;
/// Additional wall time per attached tool group.
const TOOL_GROUP_DURATION_MS: u64 = 3_000;

/// Pre-execution estimate for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEstimate {
    /// The stage name.
    pub name: String,
    /// The model the router would select.
    pub model: String,
    /// Estimated cost in USD.
    pub estimated_cost_usd: f64,
    /// Estimated wall time in milliseconds.
    pub estimated_duration_ms: u64,
}

/// Pre-execution estimate for a whole workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Sum of per-stage cost estimates.
    pub total_cost_usd: f64,
    /// Level-aware wall time: max within a level, summed across levels.
    pub estimated_duration_ms: u64,
    /// Per-stage breakdown in declaration order.
    pub stages: Vec<StageEstimate>,
}

/// Estimates workflow cost and duration before anything runs.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    pricing: Arc<PricingTable>,
    router: ModelRouter,
    default_model: String,
}

impl CostEstimator {
    /// Creates an estimator.
    #[must_use]
    pub fn new(pricing: Arc<PricingTable>, router: ModelRouter, default_model: impl Into<String>) -> Self {
        Self {
            pricing,
            router,
            default_model: default_model.into(),
        }
    }

    /// Estimates the cost and wall time of running `workflow`.
    ///
    /// # Errors
    ///
    /// Returns a cycle error for a cyclic stage graph, or a validation
    /// error when sub-workflow nesting exceeds
    /// [`MAX_SUB_WORKFLOW_DEPTH`].
    pub fn estimate(&self, workflow: &WorkflowDefinition) -> Result<CostEstimate, EngineError> {
        self.estimate_at_depth(workflow, 0)
    }

    fn estimate_at_depth(
        &self,
        workflow: &WorkflowDefinition,
        depth: usize,
    ) -> Result<CostEstimate, EngineError> {
        if depth > MAX_SUB_WORKFLOW_DEPTH {
            return Err(EngineError::Validation(format!(
                "sub-workflow nesting in '{}' exceeds depth {MAX_SUB_WORKFLOW_DEPTH}",
                workflow.name
            )));
        }

        dag::validate_acyclic(workflow)?;
        let levels = dag::execution_levels(workflow)?;

        let mut stages = Vec::with_capacity(workflow.stages.len());
        for stage in &workflow.stages {
            stages.push(self.estimate_stage(stage, depth)?);
        }

        let total_cost_usd = stages.iter().map(|s| s.estimated_cost_usd).sum();

        // Stages within a level run concurrently; levels run in order.
        let mut estimated_duration_ms = 0;
        for level in &levels {
            let level_max = level
                .iter()
                .filter_map(|name| stages.iter().find(|s| &s.name == name))
                .map(|s| s.estimated_duration_ms)
                .max()
                .unwrap_or(0);
            estimated_duration_ms += level_max;
        }

        Ok(CostEstimate {
            total_cost_usd,
            estimated_duration_ms,
            stages,
        })
    }

    fn estimate_stage(&self, stage: &StageDef, depth: usize) -> Result<StageEstimate, EngineError> {
        if let Some(nested) = &stage.sub_workflow {
            let nested_estimate = self.estimate_at_depth(nested, depth + 1)?;
            return Ok(StageEstimate {
                name: stage.name.clone(),
                model: String::new(),
                estimated_cost_usd: nested_estimate.total_cost_usd,
                estimated_duration_ms: nested_estimate.estimated_duration_ms,
            });
        }

        let prompt_tokens = stage
            .prompt
            .as_deref()
            .map_or(0, |p| (p.len() / CHARS_PER_TOKEN) as u32);
        let usage = TokenUsage {
            input_tokens: BASE_INPUT_TOKENS
                + prompt_tokens
                + TOKENS_PER_DEPENDENCY * stage.depends_on.len() as u32,
            output_tokens: stage.max_tokens.unwrap_or(DEFAULT_OUTPUT_TOKENS),
        };

        let model = self
            .router
            .route(stage.model.as_deref().unwrap_or(&self.default_model));

        Ok(StageEstimate {
            name: stage.name.clone(),
            estimated_cost_usd: self.pricing.cost(&model, usage),
            estimated_duration_ms: CALL_DURATION_MS
                + TOOL_GROUP_DURATION_MS * stage.tools.len() as u64,
            model,
        })
    }
}

/// Capability tier a model id is bucketed into for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelTier {
    Light,
    Standard,
    Frontier,
}

fn tier_of(model: &str) -> ModelTier {
    let lower = model.to_ascii_lowercase();
    if lower.contains("opus") || (lower.contains("gpt-4") && !lower.contains("mini")) {
        ModelTier::Frontier
    } else if lower.contains("haiku") || lower.contains("mini") || lower.contains("flash") {
        ModelTier::Light
    } else {
        ModelTier::Standard
    }
}

/// Maps a desired model id to an equivalent available one.
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    available: Vec<String>,
}

impl ModelRouter {
    /// Creates a router over the set of currently available models.
    ///
    /// An empty set means "everything is available": desired ids pass
    /// through unchanged.
    #[must_use]
    pub fn new(available: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            available: available.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolves the desired model to an available one.
    ///
    /// Exact matches pass through; otherwise the first available model
    /// in the same capability tier is chosen, then any standard-tier
    /// model, then the first available.
    #[must_use]
    pub fn route(&self, desired: &str) -> String {
        if self.available.is_empty() || self.available.iter().any(|m| m == desired) {
            return desired.to_string();
        }

        let want = tier_of(desired);
        if let Some(found) = self.available.iter().find(|m| tier_of(m) == want) {
            return found.clone();
        }
        if let Some(found) = self
            .available
            .iter()
            .find(|m| tier_of(m) == ModelTier::Standard)
        {
            return found.clone();
        }
        self.available[0].clone()
    }
}
