//! Model-backed claim extraction.

use super::{Claim, ClaimCategory, ClaimStatus, VerifierControls};
use crate::errors::EngineError;
use crate::provider::{ChatMessage, ModelProvider, ModelReply, ModelRequest, TokenUsage};
use crate::retry::{with_retry, RetryPolicy};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract factual claims from analysis text. \
Respond with a JSON array only. Each element is an object with fields: \
\"text\" (the claim, verbatim or lightly normalized), \
\"category\" (one of: metric, event, comparison, projection, general), \
\"value\" (the numeric value if the claim carries one, else null), \
\"unit\" (the unit of the value if any, else null). \
Extract only checkable factual assertions, not opinions or hedged statements.";

const EXTRACTION_MAX_TOKENS: u32 = 2048;

const CHARS_PER_TOKEN: usize = 4;

const BASE_INPUT_TOKENS: u32 = 500;

/// Asks the model for the claims in `analysis`.
///
/// With [`VerifierControls`] attached the call is reserved against the
/// run's budget, scheduled under its gate, and retried on transient
/// failures. Any failure, from the reservation through JSON parsing,
/// degrades to an empty claim list.
pub(super) async fn extract_claims(
    provider: &Arc<dyn ModelProvider>,
    model: &str,
    analysis: &str,
    controls: Option<&VerifierControls>,
) -> Vec<Claim> {
    let request = ModelRequest {
        model: model.to_string(),
        system_prompt: Some(EXTRACTION_SYSTEM_PROMPT.to_string()),
        messages: vec![ChatMessage::user(format!(
            "Extract the factual claims from this analysis:\n\n{analysis}"
        ))],
        temperature: Some(0.0),
        max_tokens: Some(EXTRACTION_MAX_TOKENS),
        tools: Vec::new(),
    };

    let result = match controls {
        Some(controls) => budgeted_invoke(provider, request, controls).await,
        None => provider.invoke(request, None).await,
    };

    match result {
        Ok(reply) => parse_claims(&reply.content),
        Err(err) => {
            warn!(error = %err, "claim extraction call failed");
            Vec::new()
        }
    }
}

/// Runs the extraction call under the run's budget, gate, and retry
/// policy, mirroring how stage calls are made.
async fn budgeted_invoke(
    provider: &Arc<dyn ModelProvider>,
    request: ModelRequest,
    controls: &VerifierControls,
) -> Result<ModelReply, EngineError> {
    let prompt_len: usize = request.messages.iter().map(|m| m.content.len()).sum();
    let projected = TokenUsage {
        input_tokens: BASE_INPUT_TOKENS + (prompt_len / CHARS_PER_TOKEN) as u32,
        output_tokens: EXTRACTION_MAX_TOKENS,
    };
    let estimate = controls.pricing.cost(&request.model, projected);
    let reservation = controls.tracker.reserve(estimate, controls.budget)?;

    let model = request.model.clone();
    let result = with_retry(&RetryPolicy::llm_rate_limit(), &controls.abort, || {
        let request = request.clone();
        let provider = provider.clone();
        let gate = controls.gate.clone();
        async move { gate.run(|| provider.invoke(request, None)).await }
    })
    .await;

    match result {
        Ok(outcome) => {
            let reply = outcome.value;
            let cost = controls.pricing.cost(&model, reply.usage);
            controls.tracker.finalize(reservation, cost);
            Ok(reply)
        }
        Err(err) => {
            controls.tracker.finalize(reservation, 0.0);
            Err(err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    #[serde(default)]
    text: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    unit: Option<String>,
}

/// Parses the model's response into claims.
///
/// Tolerates code fences and prose around the array; the first balanced
/// `[...]` is taken as the payload. Entries with empty text are dropped
/// and unknown categories become `general`.
pub(super) fn parse_claims(raw: &str) -> Vec<Claim> {
    let body = strip_code_fences(raw);
    let Some(array) = first_json_array(body) else {
        warn!("no JSON array in extraction response");
        return Vec::new();
    };

    let parsed: Vec<RawClaim> = match serde_json::from_str(array) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "extraction response did not parse as claims");
            return Vec::new();
        }
    };

    parsed
        .into_iter()
        .filter(|raw| !raw.text.trim().is_empty())
        .enumerate()
        .map(|(i, raw)| Claim {
            id: format!("claim-{}", i + 1),
            text: raw.text.trim().to_string(),
            category: raw
                .category
                .as_deref()
                .map(ClaimCategory::parse)
                .unwrap_or_default(),
            status: ClaimStatus::Unverified,
            confidence: 0.0,
            sources: Vec::new(),
            value: raw.value.as_ref().and_then(numeric_value),
            unit: raw.unit.filter(|u| !u.trim().is_empty()),
            source_value: None,
            reasoning: String::new(),
        })
        .collect()
}

/// Coerces a JSON value to f64; numeric strings like `"50.5"` count.
fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Returns the content of the first fenced block, or the input unchanged.
fn strip_code_fences(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after_fence = &raw[open + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n').map_or(0, |i| i + 1);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Locates the first balanced top-level JSON array in `text`.
fn first_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_plain_array() {
        let claims = parse_claims(
            r#"[{"text": "Revenue grew 12%", "category": "metric", "value": 12, "unit": "%"}]"#,
        );
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id, "claim-1");
        assert_eq!(claims[0].category, ClaimCategory::Metric);
        assert_eq!(claims[0].value, Some(12.0));
        assert_eq!(claims[0].unit.as_deref(), Some("%"));
    }

    #[test]
    fn test_parse_fenced_array_with_prose() {
        let raw = "Here are the claims:\n```json\n[{\"text\": \"X acquired Y\", \"category\": \"event\"}]\n```\nDone.";
        let claims = parse_claims(raw);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].category, ClaimCategory::Event);
        assert_eq!(claims[0].value, None);
    }

    #[test]
    fn test_parse_skips_empty_text_and_renumbers() {
        let claims = parse_claims(
            r#"[{"text": "  "}, {"text": "real claim"}, {"text": "another"}]"#,
        );
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].id, "claim-1");
        assert_eq!(claims[0].text, "real claim");
        assert_eq!(claims[1].id, "claim-2");
    }

    #[test]
    fn test_parse_unknown_category_is_general() {
        let claims = parse_claims(r#"[{"text": "hmm", "category": "vibes"}]"#);
        assert_eq!(claims[0].category, ClaimCategory::General);
    }

    #[test]
    fn test_parse_garbage_yields_nothing() {
        assert!(parse_claims("no array here").is_empty());
        assert!(parse_claims("[1, 2, unbalanced").is_empty());
        assert!(parse_claims("").is_empty());
    }

    #[test]
    fn test_array_with_bracket_inside_string() {
        let claims = parse_claims(r#"[{"text": "uses [brackets] inside"}]"#);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].text, "uses [brackets] inside");
    }

    #[test]
    fn test_numeric_value_from_string() {
        let claims = parse_claims(r#"[{"text": "n", "value": "42.5"}]"#);
        assert_eq!(claims[0].value, Some(42.5));
    }
}
