//! Types and pure post-processing helpers shared by the selection pipeline
//! and the orchestrator. Every tier of the cascade produces a
//! `SelectionResult`; the helpers here apply the same cap/dedupe/confidence
//! rules regardless of which tier produced it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default per-evaluation cap on the number of selected files.
pub const DEFAULT_FILE_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMethod {
    Cache,
    RuleBased,
    LlmAssisted,
    Fallback,
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMethod::Cache => "cache",
            SelectionMethod::RuleBased => "rule-based",
            SelectionMethod::LlmAssisted => "llm-assisted",
            SelectionMethod::Fallback => "fallback",
        }
    }
}

/// The uniform output of every cascade tier: the chosen files, which tier
/// produced them, a confidence in `[0, 1]`, and a short human-readable
/// justification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub selected_files: Vec<String>,
    pub method: SelectionMethod,
    pub confidence: f64,
    pub reasoning: String,
}

/// Deduplicate while preserving first-seen order.
pub fn dedupe_preserve_order(paths: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(paths.len());
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        if seen.insert(path.clone()) {
            out.push(path);
        }
    }
    out
}

/// Enforce the per-evaluation file cap, truncating the tail.
pub fn enforce_file_cap(mut paths: Vec<String>, cap: usize) -> Vec<String> {
    paths.truncate(cap);
    paths
}

/// Fraction of `criteria_total` criteria that have at least one selected
/// file with a relevance score at or above `threshold`. Used to scale a
/// tier's raw confidence by how much of the rubric it actually covers, and
/// by Tier 3's escalation gate (coverage below a per-course minimum).
pub fn coverage_ratio(criteria_with_evidence: usize, criteria_total: usize) -> f64 {
    if criteria_total == 0 {
        return 0.0;
    }
    (criteria_with_evidence as f64 / criteria_total as f64).min(1.0)
}

/// Scale a tier's self-reported confidence by rubric coverage.
pub fn scaled_confidence(raw_confidence: f64, coverage: f64) -> f64 {
    (raw_confidence * coverage).clamp(0.0, 1.0)
}

/// Apply dedupe + cap in the canonical order spec'd for post-processing.
pub fn finalize_selection(paths: Vec<String>, cap: usize) -> Vec<String> {
    enforce_file_cap(dedupe_preserve_order(paths), cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        let paths = vec!["b.py".to_string(), "a.py".to_string(), "b.py".to_string()];
        assert_eq!(dedupe_preserve_order(paths), vec!["b.py".to_string(), "a.py".to_string()]);
    }

    #[test]
    fn cap_truncates_tail() {
        let paths: Vec<String> = (0..10).map(|i| format!("f{i}.py")).collect();
        assert_eq!(enforce_file_cap(paths, 3).len(), 3);
    }

    #[test]
    fn coverage_ratio_full_and_zero_criteria() {
        assert_eq!(coverage_ratio(2, 2), 1.0);
        assert_eq!(coverage_ratio(0, 0), 0.0);
        assert_eq!(coverage_ratio(1, 2), 0.5);
    }
}
