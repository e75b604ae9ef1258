//! Report assembly and footnote annotation.

use super::{Claim, ClaimStatus, VerificationReport};

/// How much of a claim's leading text to use for fuzzy placement when
/// it has no clause boundary.
const FRAGMENT_CHARS: usize = 60;

/// Aggregates statuses and annotates `analysis` with footnote markers.
pub(super) fn build_report(claims: Vec<Claim>, analysis: &str) -> VerificationReport {
    let verified = count(&claims, ClaimStatus::Verified);
    let disputed = count(&claims, ClaimStatus::Disputed);
    let unverified = count(&claims, ClaimStatus::Unverified);
    let errors = count(&claims, ClaimStatus::Error);

    let average_confidence = if claims.is_empty() {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let mean = claims.iter().map(|c| c.confidence).sum::<f64>() / claims.len() as f64;
        (mean * 100.0).round() / 100.0
    };

    let annotated_text = annotate(analysis, &claims);
    let footnotes = claims.iter().map(footnote).collect();

    VerificationReport {
        claims,
        verified,
        disputed,
        unverified,
        errors,
        average_confidence,
        annotated_text,
        footnotes,
    }
}

fn count(claims: &[Claim], status: ClaimStatus) -> usize {
    claims.iter().filter(|c| c.status == status).count()
}

fn status_name(status: ClaimStatus) -> &'static str {
    match status {
        ClaimStatus::Verified => "verified",
        ClaimStatus::Disputed => "disputed",
        ClaimStatus::Unverified => "unverified",
        ClaimStatus::Error => "error",
    }
}

/// One footnote line: status, confidence, source labels, reasoning.
fn footnote(claim: &Claim) -> String {
    let confidence_pct = (claim.confidence * 100.0).round();
    let mut line = format!(
        "[^{}]: {} ({confidence_pct:.0}%)",
        claim.id,
        status_name(claim.status)
    );
    if !claim.sources.is_empty() {
        let labels: Vec<&str> = claim.sources.iter().map(|s| s.label.as_str()).collect();
        line.push_str(&format!(", sources: {}", labels.join(", ")));
    }
    if !claim.reasoning.is_empty() {
        line.push_str(&format!(". {}", claim.reasoning));
    }
    line
}

/// Inserts `[^claim-id]` markers into `analysis`.
///
/// Preferred position is right after the first literal occurrence of
/// the claim text. Failing that, the claim's leading fragment locates
/// the containing sentence and the marker goes at that sentence's end.
/// Claims that match neither way are left out of the annotation.
/// Insertions are applied back to front so earlier byte offsets stay
/// valid.
fn annotate(analysis: &str, claims: &[Claim]) -> String {
    let mut insertions: Vec<(usize, String)> = claims
        .iter()
        .filter_map(|claim| {
            insertion_point(analysis, &claim.text).map(|at| (at, format!("[^{}]", claim.id)))
        })
        .collect();

    insertions.sort_by_key(|(at, _)| *at);
    let mut out = analysis.to_string();
    for (at, marker) in insertions.into_iter().rev() {
        out.insert_str(at, &marker);
    }
    out
}

fn insertion_point(analysis: &str, claim_text: &str) -> Option<usize> {
    if let Some(pos) = analysis.find(claim_text) {
        return Some(pos + claim_text.len());
    }

    let fragment = leading_fragment(claim_text);
    if fragment.is_empty() {
        return None;
    }
    let pos = analysis.find(fragment)?;
    Some(sentence_end(analysis, pos + fragment.len()))
}

/// The first clause of `text` (before a comma or semicolon), or its
/// first ~60 chars when it has no clause boundary.
fn leading_fragment(text: &str) -> &str {
    let clause = text
        .split_once([',', ';'])
        .map_or(text, |(head, _)| head)
        .trim();
    if clause.len() < text.trim().len() {
        return clause;
    }
    match text.char_indices().nth(FRAGMENT_CHARS) {
        Some((byte, _)) => text[..byte].trim_end(),
        None => text.trim(),
    }
}

/// Byte offset just past the sentence containing `from`.
fn sentence_end(analysis: &str, from: usize) -> usize {
    analysis[from..]
        .find(['.', '!', '?'])
        .map_or(analysis.len(), |i| from + i + 1)
}
