//! Cost tracking, pricing, and pre-execution estimation.
//!
//! The [`CostTracker`] is the only mutable object shared across
//! concurrently running stages; everything else here is read-only
//! lookup data.

mod estimator;
mod pricing;
mod tracker;

pub use estimator::{
    CostEstimate, CostEstimator, ModelRouter, StageEstimate, MAX_SUB_WORKFLOW_DEPTH,
};
pub use pricing::{ModelPricing, PricingTable};
pub use tracker::{CostTracker, Reservation};
