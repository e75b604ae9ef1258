//! Post-hoc claim verification.
//!
//! Cross-checks factual assertions in a verify stage's output against
//! the outputs of prior stages: a model extracts candidate claims, a
//! keyword/numeric linker ties them to evidence, and a report phase
//! aggregates statuses and annotates the original text with footnote
//! markers.
//!
//! Verification is advisory. Extraction and linking failures are
//! swallowed at the claim level; a malformed model response yields zero
//! claims, never an error.

mod extract;
mod link;
mod report;

use crate::cancellation::AbortSignal;
use crate::cost::{CostTracker, PricingTable};
use crate::provider::ModelProvider;
use crate::semaphore::CallGate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub use link::DEFAULT_VALUE_TOLERANCE;

/// Category of an extracted claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimCategory {
    /// A quantitative figure (revenue, margin, count).
    Metric,
    /// A dated or datable occurrence.
    Event,
    /// A relative statement between entities or periods.
    Comparison,
    /// A forward-looking statement.
    Projection,
    /// Everything else, including unrecognized categories.
    #[default]
    General,
}

impl ClaimCategory {
    /// Parses a category name; unknown names become [`Self::General`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "metric" => Self::Metric,
            "event" => Self::Event,
            "comparison" => Self::Comparison,
            "projection" => Self::Projection,
            _ => Self::General,
        }
    }
}

/// Verification status of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// No supporting evidence was found.
    #[default]
    Unverified,
    /// Evidence supports the claim.
    Verified,
    /// Evidence contradicts the claim's value.
    Disputed,
    /// Verification of this claim failed.
    Error,
}

/// One piece of linked evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSource {
    /// The prior stage the evidence came from.
    pub label: String,
    /// The densest matching window of the source, capped at 500 chars.
    pub excerpt: String,
}

/// One extracted factual assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Sequential id: `claim-1`, `claim-2`, ... in extraction order.
    pub id: String,
    /// The claim text as extracted.
    pub text: String,
    /// The claim category.
    pub category: ClaimCategory,
    /// Current verification status.
    pub status: ClaimStatus,
    /// Confidence in the status, in `[0, 1]`.
    pub confidence: f64,
    /// Linked evidence. Once populated, never cleared.
    pub sources: Vec<ClaimSource>,
    /// Numeric value carried by the claim, if any.
    pub value: Option<f64>,
    /// Unit of the numeric value.
    pub unit: Option<String>,
    /// Closest numeric value found in the sources, recorded even when
    /// the match failed.
    pub source_value: Option<f64>,
    /// How the status was decided.
    pub reasoning: String,
}

/// Aggregate output of one verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// All claims with their final statuses.
    pub claims: Vec<Claim>,
    /// Count of verified claims.
    pub verified: usize,
    /// Count of disputed claims.
    pub disputed: usize,
    /// Count of unverified claims.
    pub unverified: usize,
    /// Count of claims whose verification errored.
    pub errors: usize,
    /// Mean confidence across all claims, rounded to 2 decimals.
    pub average_confidence: f64,
    /// The analysis text with `[^claim-id]` markers inserted.
    pub annotated_text: String,
    /// One footnote line per claim.
    pub footnotes: Vec<String>,
}

/// Run-level execution controls shared with the verifier.
///
/// With controls attached, the extraction call is reserved against the
/// run's budget, scheduled under its call gate, and retried like any
/// stage call. Without them the verifier calls the provider directly,
/// which is only appropriate outside an engine run.
#[derive(Clone)]
pub struct VerifierControls {
    /// The run's shared cost ledger.
    pub tracker: Arc<CostTracker>,
    /// The run's budget ceiling in USD.
    pub budget: f64,
    /// Pricing used to size the extraction reservation.
    pub pricing: Arc<PricingTable>,
    /// The run's concurrency gate.
    pub gate: CallGate,
    /// The run's abort signal.
    pub abort: Arc<AbortSignal>,
}

impl std::fmt::Debug for VerifierControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierControls")
            .field("budget", &self.budget)
            .finish()
    }
}

/// Runs the extract → link → report pipeline.
pub struct ClaimVerifier {
    provider: Arc<dyn ModelProvider>,
    model: String,
    tolerance: f64,
    controls: Option<VerifierControls>,
}

impl std::fmt::Debug for ClaimVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimVerifier")
            .field("model", &self.model)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl ClaimVerifier {
    /// Creates a verifier using `model` for claim extraction.
    #[must_use]
    pub fn new(provider: Arc<dyn ModelProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            tolerance: DEFAULT_VALUE_TOLERANCE,
            controls: None,
        }
    }

    /// Overrides the relative tolerance for non-integer value matching.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Attaches run-level budget, gate, and abort controls to the
    /// extraction call.
    #[must_use]
    pub fn with_controls(mut self, controls: VerifierControls) -> Self {
        self.controls = Some(controls);
        self
    }

    /// Verifies `analysis` against the named prior-stage `sources`.
    pub async fn verify(
        &self,
        analysis: &str,
        sources: &HashMap<String, String>,
    ) -> VerificationReport {
        let mut claims =
            extract::extract_claims(&self.provider, &self.model, analysis, self.controls.as_ref())
                .await;
        debug!(claims = claims.len(), "extracted claims");
        link::link_claims(&mut claims, sources, self.tolerance);
        report::build_report(claims, analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use serde_json::json;

    fn sources(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_revenue_claim_verified_against_source() {
        let provider = Arc::new(MockProvider::new());
        provider.push_text(
            json!([
                {"text": "Revenue was $50 billion", "category": "metric", "value": 50e9, "unit": "USD"}
            ])
            .to_string(),
        );

        let verifier = ClaimVerifier::new(provider, "claude-3-5-haiku");
        let report = verifier
            .verify(
                "Revenue was $50 billion this year.",
                &sources(&[("research", "Revenue of $50 billion reported.")]),
            )
            .await;

        assert_eq!(report.claims.len(), 1);
        let claim = &report.claims[0];
        assert_eq!(claim.status, ClaimStatus::Verified);
        assert!((claim.confidence - 0.9).abs() < 1e-9);
        assert_eq!(claim.source_value, Some(50_000_000_000.0));
        assert_eq!(report.verified, 1);
    }

    #[tokio::test]
    async fn test_malformed_extraction_yields_empty_report() {
        let provider = Arc::new(MockProvider::new());
        provider.push_text("I could not find any claims, sorry!".to_string());

        let verifier = ClaimVerifier::new(provider, "claude-3-5-haiku");
        let report = verifier.verify("Some analysis.", &HashMap::new()).await;

        assert!(report.claims.is_empty());
        assert_eq!(report.average_confidence, 0.0);
        assert_eq!(report.annotated_text, "Some analysis.");
    }

    #[tokio::test]
    async fn test_provider_failure_is_swallowed() {
        let provider = Arc::new(MockProvider::new());
        provider.push_error("500 internal error");

        let verifier = ClaimVerifier::new(provider, "claude-3-5-haiku");
        let report = verifier.verify("Anything.", &HashMap::new()).await;
        assert!(report.claims.is_empty());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(ClaimCategory::parse("Metric"), ClaimCategory::Metric);
        assert_eq!(ClaimCategory::parse("projection"), ClaimCategory::Projection);
        assert_eq!(ClaimCategory::parse("made-up"), ClaimCategory::General);
    }
}
