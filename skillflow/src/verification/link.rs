//! Keyword and numeric linking of claims to source material.

use super::{Claim, ClaimSource, ClaimStatus};
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// Default relative tolerance for non-integer value matching (0.1%).
pub const DEFAULT_VALUE_TOLERANCE: f64 = 0.001;

/// A source must contain at least this fraction of a claim's keywords
/// (rounded up) to count as linked.
const KEYWORD_THRESHOLD: f64 = 0.4;

/// Excerpts are the densest 3-line window of a linked source.
const EXCERPT_WINDOW_LINES: usize = 3;

/// Hard cap on excerpt length, in characters.
const EXCERPT_MAX_CHARS: usize = 500;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "with", "that", "this", "from", "has", "have",
    "had", "its", "their", "will", "would", "been", "being", "than", "then", "over", "under",
    "into", "about", "after", "before", "during", "while", "which", "where", "when", "what",
    "who", "whom", "whose", "not", "but", "also", "more", "most", "some", "such", "can",
    "could", "should", "may", "might", "per", "each", "all", "any", "both",
];

/// Links every claim to its supporting sources and settles statuses.
///
/// Never errors: a claim that cannot be matched stays `Unverified` at
/// confidence 0.0 with its reasoning explaining why.
pub(super) fn link_claims(
    claims: &mut [Claim],
    sources: &HashMap<String, String>,
    tolerance: f64,
) {
    let number_re = match Regex::new(
        r"(?i)\$?(\d[\d,]*(?:\.\d+)?)\s*(trillion|billion|million|thousand|[tbmk]\b)?",
    ) {
        Ok(re) => re,
        Err(err) => {
            warn!(error = %err, "number pattern failed to compile");
            return;
        }
    };

    // Deterministic source order regardless of map iteration.
    let mut ordered: Vec<(&String, &String)> = sources.iter().collect();
    ordered.sort_by_key(|(label, _)| label.as_str());

    for claim in claims.iter_mut() {
        let kws = keywords(&claim.text);
        if kws.is_empty() {
            claim.reasoning = "claim has no usable keywords".to_string();
            continue;
        }
        let threshold = keyword_threshold(kws.len());

        for (label, text) in &ordered {
            let lower = text.to_lowercase();
            let hits = kws.iter().filter(|kw| lower.contains(kw.as_str())).count();
            if hits >= threshold {
                claim.sources.push(ClaimSource {
                    label: (*label).clone(),
                    excerpt: densest_window(text, &kws),
                });
            }
        }

        settle(claim, sources, &number_re, tolerance);
    }
}

/// Decides status, confidence, and reasoning for a linked claim.
fn settle(
    claim: &mut Claim,
    sources: &HashMap<String, String>,
    number_re: &Regex,
    tolerance: f64,
) {
    if claim.sources.is_empty() {
        claim.status = ClaimStatus::Unverified;
        claim.confidence = 0.0;
        claim.reasoning = "no supporting source found".to_string();
        return;
    }

    if let Some(value) = claim.value {
        let mut candidates: Vec<f64> = Vec::new();
        for source in &claim.sources {
            if let Some(text) = sources.get(&source.label) {
                candidates.extend(extract_numbers(number_re, text));
            }
        }
        if !candidates.is_empty() {
            if let Some(matched) = candidates
                .iter()
                .copied()
                .find(|n| values_match(value, *n, tolerance))
            {
                claim.status = ClaimStatus::Verified;
                claim.confidence = 0.9;
                claim.source_value = Some(matched);
                claim.reasoning = format!("value {value} matches source value {matched}");
            } else {
                let nearest = candidates
                    .iter()
                    .copied()
                    .min_by(|a, b| {
                        (a - value)
                            .abs()
                            .partial_cmp(&(b - value).abs())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(value);
                claim.status = ClaimStatus::Disputed;
                claim.confidence = 0.3;
                claim.source_value = Some(nearest);
                claim.reasoning =
                    format!("value {value} not found in sources, nearest is {nearest}");
            }
            return;
        }
        // Numeric claim but the linked sources carry no numbers at all:
        // treat it like a non-numeric claim.
    }

    claim.status = ClaimStatus::Verified;
    claim.confidence = 0.7;
    claim.reasoning = format!("referenced in {} source(s)", claim.sources.len());
}

/// Lowercased words longer than 2 chars, stop words removed, deduped.
pub(super) fn keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.len() <= 2 {
            continue;
        }
        let lower = word.to_lowercase();
        if STOP_WORDS.contains(&lower.as_str()) || out.contains(&lower) {
            continue;
        }
        out.push(lower);
    }
    out
}

/// `ceil(0.4 * n)`, but at least 1.
pub(super) fn keyword_threshold(n: usize) -> usize {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let t = (KEYWORD_THRESHOLD * n as f64).ceil() as usize;
    t.max(1)
}

/// The 3-line window of `text` with the most keyword occurrences.
fn densest_window(text: &str, kws: &[String]) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let window = EXCERPT_WINDOW_LINES.min(lines.len());
    let mut best_start = 0;
    let mut best_hits = 0usize;
    for start in 0..=lines.len() - window {
        let joined = lines[start..start + window].join("\n").to_lowercase();
        let hits: usize = kws.iter().map(|kw| joined.matches(kw.as_str()).count()).sum();
        if hits > best_hits {
            best_hits = hits;
            best_start = start;
        }
    }
    let excerpt = lines[best_start..best_start + window].join("\n");
    truncate_chars(&excerpt, EXCERPT_MAX_CHARS)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// All numbers in `text`, with `$1.5B`-style scale suffixes expanded.
pub(super) fn extract_numbers(re: &Regex, text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(digits) = caps.get(1) else { continue };
        let cleaned = digits.as_str().replace(',', "");
        let Ok(base) = cleaned.parse::<f64>() else {
            continue;
        };
        let scale = caps
            .get(2)
            .map(|m| scale_multiplier(m.as_str()))
            .unwrap_or(1.0);
        out.push(base * scale);
    }
    out
}

fn scale_multiplier(suffix: &str) -> f64 {
    match suffix.to_ascii_lowercase().as_str() {
        "t" | "trillion" => 1e12,
        "b" | "billion" => 1e9,
        "m" | "million" => 1e6,
        "k" | "thousand" => 1e3,
        _ => 1.0,
    }
}

/// Integers (zero included) must match exactly; other values within
/// relative tolerance.
fn values_match(claimed: f64, found: f64, tolerance: f64) -> bool {
    if claimed.fract() == 0.0 {
        // Exact up to float representation noise.
        (found - claimed).abs() <= claimed.abs() * 1e-12 + 1e-9
    } else {
        ((found - claimed) / claimed).abs() <= tolerance
    }
}
