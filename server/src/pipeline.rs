//! Selection Pipeline (§4.5): the four-tier cascade (Cache -> Rule-Based ->
//! LLM-Assisted -> Fallback) that chooses which files are shown to the
//! grading model. Structured the way the tiered cascade the pack's
//! `captain-hook` crate uses for its command-policy decisions is structured:
//! an ordered list of `CascadeTier`s, the first to resolve wins.

use async_trait::async_trait;
use regex::Regex;
use rubricforge_core::pipeline_types::{finalize_selection, scaled_confidence, SelectionMethod, SelectionResult};
use rubricforge_core::{Course, RepoSignature};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{Cache, LookupOutcome};
use crate::error::ApiError;
use crate::model_client::ModelClient;
use crate::types::{StrategyPerformance, StrategySource};

/// Minimum fraction of criteria that must have qualifying evidence before
/// Tier 2's result is accepted without escalating to Tier 3.
const MIN_RULE_COVERAGE: f64 = 1.0;
const RULE_SCORE_THRESHOLD: f64 = 1.0;

pub struct PipelineInput<'a> {
    pub signature: &'a RepoSignature,
    pub course: &'a Course,
    pub listing: &'a [String],
    pub file_cap: usize,
}

#[async_trait]
pub trait CascadeTier: Send + Sync {
    async fn evaluate(&self, input: &PipelineInput<'_>) -> Result<Option<SelectionResult>, ApiError>;
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Tier 1 — Cache
// ---------------------------------------------------------------------------

pub struct CacheTier {
    cache: Arc<Cache>,
}

impl CacheTier {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CascadeTier for CacheTier {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn evaluate(&self, input: &PipelineInput<'_>) -> Result<Option<SelectionResult>, ApiError> {
        match self.cache.lookup(input.signature, &input.course.course_id).await {
            LookupOutcome::Hit { strategy, confidence, .. } => Ok(Some(SelectionResult {
                selected_files: strategy.selected_files,
                method: SelectionMethod::Cache,
                confidence,
                reasoning: format!("matched cached strategy {}", strategy.id),
            })),
            LookupOutcome::Miss => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tier 2 — Rule-based
// ---------------------------------------------------------------------------

pub struct RuleBasedTier {
    cache: Arc<Cache>,
    similarity_threshold: f64,
}

impl RuleBasedTier {
    pub fn new(cache: Arc<Cache>, similarity_threshold: f64) -> Self {
        Self { cache, similarity_threshold }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Course-agnostic "hot" directory prefixes that carry evidentiary weight
/// regardless of which criterion they support.
const HOT_PREFIXES: &[&str] = &["dbt/", "src/pipeline/", "terraform/", "src/"];

fn basename_importance(path: &str) -> f64 {
    let base = basename(path).to_lowercase();
    if base.starts_with("readme") {
        2.0
    } else if base == "requirements.txt" || base == "cargo.toml" || base == "package.json" || base == "dockerfile" {
        1.5
    } else {
        0.0
    }
}

fn directory_affinity(path: &str) -> f64 {
    if HOT_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        1.0
    } else {
        0.0
    }
}

/// Score of `path` as evidence for `hint`: a glob-ish prefix/suffix match on
/// the hint, or a keyword contained in the path.
fn hint_match_score(path: &str, hint: &str) -> f64 {
    let lower_path = path.to_lowercase();
    let lower_hint = hint.to_lowercase();

    if let Some(stripped) = lower_hint.strip_suffix('/') {
        if lower_path.starts_with(stripped) || lower_path.contains(&format!("/{stripped}/")) {
            return 3.0;
        }
        return 0.0;
    }

    if let Some(ext) = lower_hint.strip_prefix("*.") {
        if lower_path.ends_with(&format!(".{ext}")) {
            return 2.0;
        }
        return 0.0;
    }

    if Regex::new(&regex::escape(&lower_hint)).map(|re| re.is_match(&lower_path)).unwrap_or(false) {
        2.0
    } else {
        0.0
    }
}

struct RuleScore {
    path: String,
    score: f64,
    criteria_hit: Vec<usize>,
}

fn score_listing(listing: &[String], course: &Course) -> Vec<RuleScore> {
    let mut scores: Vec<RuleScore> = listing
        .iter()
        .map(|path| {
            let mut score = basename_importance(path) + directory_affinity(path);
            let mut criteria_hit = Vec::new();
            for (idx, criterion) in course.criteria.iter().enumerate() {
                let hint_score: f64 =
                    criterion.evidence_hints.iter().map(|hint| hint_match_score(path, hint)).sum();
                if hint_score >= RULE_SCORE_THRESHOLD {
                    criteria_hit.push(idx);
                }
                score += hint_score;
            }
            RuleScore { path: path.clone(), score, criteria_hit }
        })
        .filter(|s| s.score > 0.0)
        .collect();

    // Tie-breaking is lexicographic on the path.
    scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap().then_with(|| a.path.cmp(&b.path)));
    scores
}

/// Rule-based selection plus the coverage ratio (criteria with at least one
/// qualifying file) used both for Tier 2's own confidence and for Tier 3's
/// escalation gate.
pub fn rule_based_select(listing: &[String], course: &Course, file_cap: usize) -> (Vec<String>, f64) {
    let scored = score_listing(listing, course);
    let mut covered = vec![false; course.criteria.len()];
    for s in &scored {
        for &idx in &s.criteria_hit {
            covered[idx] = true;
        }
    }
    let covered_count = covered.iter().filter(|c| **c).count();
    let coverage = rubricforge_core::pipeline_types::coverage_ratio(covered_count, course.criteria.len());

    let selected: Vec<String> = scored.into_iter().take(file_cap).map(|s| s.path).collect();
    (selected, coverage)
}

#[async_trait]
impl CascadeTier for RuleBasedTier {
    fn name(&self) -> &'static str {
        "rule-based"
    }

    async fn evaluate(&self, input: &PipelineInput<'_>) -> Result<Option<SelectionResult>, ApiError> {
        let (selected, coverage) = rule_based_select(input.listing, input.course, input.file_cap);
        if selected.is_empty() {
            return Ok(None);
        }

        let raw_confidence = 0.85;
        let confidence = scaled_confidence(raw_confidence, coverage);

        if coverage >= MIN_RULE_COVERAGE {
            if confidence >= self.similarity_threshold {
                let perf = StrategyPerformance { usage_count: 1, ..Default::default() };
                if let Err(e) = self
                    .cache
                    .store(input.signature, &input.course.course_id, selected.clone(), perf, StrategySource::Tenant)
                    .await
                {
                    warn!(error = %e, "background cache store after rule-based hit failed");
                }
            }
            return Ok(Some(SelectionResult {
                selected_files: selected,
                method: SelectionMethod::RuleBased,
                confidence,
                reasoning: format!("evidence-hint scoring covered {:.0}% of criteria", coverage * 100.0),
            }));
        }

        debug!(coverage, "rule-based coverage below minimum, escalating to llm-assisted");
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Tier 3 — LLM-assisted
// ---------------------------------------------------------------------------

pub struct LlmAssistedTier {
    model_client: Arc<dyn ModelClient>,
}

impl LlmAssistedTier {
    pub fn new(model_client: Arc<dyn ModelClient>) -> Self {
        Self { model_client }
    }
}

#[async_trait]
impl CascadeTier for LlmAssistedTier {
    fn name(&self) -> &'static str {
        "llm-assisted"
    }

    async fn evaluate(&self, input: &PipelineInput<'_>) -> Result<Option<SelectionResult>, ApiError> {
        let candidates = match self.model_client.select_files(input.listing, input.course).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "llm-assisted tier failed, falling through");
                return Ok(None);
            }
        };

        let listing_set: std::collections::HashSet<&String> = input.listing.iter().collect();
        let filtered: Vec<String> = candidates
            .into_iter()
            .filter(|p| listing_set.contains(p))
            .filter(|p| rubricforge_core::passes_guardrail(p))
            .collect();

        if filtered.is_empty() {
            return Ok(None);
        }

        Ok(Some(SelectionResult {
            selected_files: filtered,
            method: SelectionMethod::LlmAssisted,
            confidence: 0.7,
            reasoning: "model-selected candidates intersected with listing".to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tier 4 — Fallback
// ---------------------------------------------------------------------------

pub struct FallbackTier;

#[async_trait]
impl CascadeTier for FallbackTier {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn evaluate(&self, input: &PipelineInput<'_>) -> Result<Option<SelectionResult>, ApiError> {
        if input.listing.is_empty() {
            return Ok(None);
        }

        let mut selected = Vec::new();
        for path in input.listing {
            let base = basename(path).to_lowercase();
            let is_readme = base.starts_with("readme");
            let is_manifest = matches!(
                base.as_str(),
                "cargo.toml" | "package.json" | "requirements.txt" | "pyproject.toml" | "go.mod" | "dockerfile"
            );
            let is_entry_point = path.starts_with("src/") && (base == "main.rs" || base == "main.py" || base == "index.js" || base == "index.ts");
            let has_keyword = input.course.criteria.iter().any(|c| {
                c.evidence_hints.iter().any(|hint| {
                    let kw = hint.trim_matches('*').trim_matches('/').to_lowercase();
                    !kw.is_empty() && path.to_lowercase().contains(&kw)
                })
            });

            if is_readme || is_manifest || is_entry_point || has_keyword {
                selected.push(path.clone());
            }
        }

        if selected.is_empty() {
            // Always produce a non-empty result when the listing is non-empty.
            selected.push(input.listing[0].clone());
        }

        Ok(Some(SelectionResult {
            selected_files: selected,
            method: SelectionMethod::Fallback,
            confidence: 0.3,
            reasoning: "no higher tier matched, used fixed heuristic".to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Cascade runner
// ---------------------------------------------------------------------------

pub struct SelectionPipeline {
    tiers: Vec<Box<dyn CascadeTier>>,
    file_cap: usize,
}

impl SelectionPipeline {
    pub fn new(tiers: Vec<Box<dyn CascadeTier>>, file_cap: usize) -> Self {
        Self { tiers, file_cap }
    }

    pub async fn select(
        &self,
        signature: &RepoSignature,
        course: &Course,
        listing: &[String],
    ) -> Result<SelectionResult, ApiError> {
        let input = PipelineInput { signature, course, listing, file_cap: self.file_cap };

        for tier in &self.tiers {
            match tier.evaluate(&input).await {
                Ok(Some(mut result)) => {
                    result.selected_files = finalize_selection(result.selected_files, self.file_cap);
                    info!(method = result.method.as_str(), confidence = result.confidence, tier = tier.name(), "selection resolved");
                    return Ok(result);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "tier raised, falling through");
                    continue;
                }
            }
        }

        Err(ApiError::InvalidInput("no tier produced a selection for an empty listing".to_string()))
    }
}
