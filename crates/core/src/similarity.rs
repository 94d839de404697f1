//! Similarity scoring between `RepoSignature`s, used by the cache to decide
//! whether a stored strategy is close enough to reuse.

use crate::signature::{RepoSignature, SizeCategory};
use std::collections::BTreeSet;

const WEIGHT_PATTERN_HASH: f64 = 0.40;
const WEIGHT_TECHNOLOGIES: f64 = 0.30;
const WEIGHT_DIRECTORY_STRUCTURE: f64 = 0.20;
const WEIGHT_SIZE_CATEGORY: f64 = 0.10;

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Weighted-sum similarity in `[0, 1]` between two signatures, per the
/// feature table: patternHash exact match 0.40, technologies Jaccard 0.30,
/// directoryStructure Jaccard 0.20, sizeCategory match 0.10.
pub fn similarity(a: &RepoSignature, b: &RepoSignature) -> f64 {
    let pattern_match = if a.pattern_hash == b.pattern_hash { 1.0 } else { 0.0 };
    let tech_jaccard = jaccard(&a.technologies, &b.technologies);
    let dir_jaccard = jaccard(&a.directory_structure, &b.directory_structure);
    let size_match = if a.size_category == b.size_category { 1.0 } else { 0.0 };

    WEIGHT_PATTERN_HASH * pattern_match
        + WEIGHT_TECHNOLOGIES * tech_jaccard
        + WEIGHT_DIRECTORY_STRUCTURE * dir_jaccard
        + WEIGHT_SIZE_CATEGORY * size_match
}

/// Confidence of a cache hit: similarity plus a small success-rate and
/// usage-count boost, clamped to 1.
pub fn confidence(similarity: f64, success_rate: f64, usage_count: u64) -> f64 {
    let usage_boost = (usage_count as f64 / 10.0).min(0.1);
    (similarity + 0.1 * success_rate + usage_boost).min(1.0)
}

pub fn size_category_matches(a: SizeCategory, b: SizeCategory) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::compute_signature;

    #[test]
    fn identical_signatures_score_one() {
        let paths = vec!["a.py".to_string(), "b/c.py".to_string()];
        let sig = compute_signature("mlops", &paths, &[], 20_000).unwrap();
        assert_eq!(similarity(&sig, &sig), 1.0);
    }

    #[test]
    fn jaccard_handles_empty_sets() {
        let empty: BTreeSet<String> = BTreeSet::new();
        assert_eq!(jaccard(&empty, &empty), 1.0);
    }

    #[test]
    fn confidence_clamps_to_one() {
        assert_eq!(confidence(1.0, 1.0, 1000), 1.0);
    }

    #[test]
    fn confidence_reflects_usage_boost() {
        let low = confidence(0.5, 0.0, 0);
        let high = confidence(0.5, 0.0, 10);
        assert!(high > low);
        assert!((high - (0.5 + 0.1)).abs() < 1e-9);
    }
}
