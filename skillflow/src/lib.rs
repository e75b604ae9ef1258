//! # Skillflow
//!
//! An execution engine for multi-stage LLM analysis workflows.
//!
//! A workflow declares named stages with prompt templates, dependency
//! edges, tool-group references, and per-stage model overrides. The
//! engine provides:
//!
//! - **DAG scheduling**: stages grouped into dependency levels, with
//!   concurrent execution inside each level
//! - **Cost control**: a reserve/finalize budget ledger shared by every
//!   stage and sub-workflow of a run
//! - **Resilience**: classified retries with exponential backoff and
//!   Retry-After hints, under a fair concurrency gate
//! - **Claim verification**: extracted factual claims cross-checked
//!   against upstream stage outputs, with annotated footnotes
//! - **Event-driven observability**: a typed event stream for progress
//!   reporting and streaming output
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use skillflow::prelude::*;
//!
//! let workflow = WorkflowDefinition::new("analysis")
//!     .with_stage(StageDef::new("gather", "Collect data on {ticker}"))
//!     .with_stage(
//!         StageDef::new("analyze", "Analyze: {gather}").with_dependency("gather"),
//!     );
//!
//! let engine = PipelineEngine::new(provider, registry);
//! let result = engine.run(&workflow, &inputs, 1.0, AbortSignal::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod agent;
pub mod cancellation;
pub mod cost;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod provider;
pub mod retry;
pub mod semaphore;
pub mod testing;
pub mod verification;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agent::{TaskAgent, TaskOutcome};
    pub use crate::cancellation::AbortSignal;
    pub use crate::cost::{
        CostEstimate, CostEstimator, CostTracker, ModelPricing, ModelRouter, PricingTable,
        Reservation, StageEstimate,
    };
    pub use crate::engine::{PipelineEngine, RunResult};
    pub use crate::errors::{CycleError, EngineError};
    pub use crate::events::{
        CollectingSink, EngineEvent, EventBus, EventSink, LoggingSink, SubscriptionId,
    };
    pub use crate::provider::{
        ChatMessage, ChunkCallback, ModelProvider, ModelReply, ModelRequest, TokenUsage, Tool,
        ToolCall, ToolRegistry, ToolSpec,
    };
    pub use crate::retry::{with_retry, ErrorCategory, RetryOutcome, RetryPolicy};
    pub use crate::semaphore::CallGate;
    pub use crate::verification::{
        Claim, ClaimCategory, ClaimSource, ClaimStatus, ClaimVerifier, VerificationReport,
        VerifierControls,
    };
    pub use crate::workflow::{OutputSpec, StageDef, WorkflowDefinition};
}
