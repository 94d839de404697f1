//! Intelligent Cache (§4.4): similarity-indexed store of prior file
//! selections, scoped per course.

use chrono::Utc;
use rubricforge_core::{self as core, RepoSignature};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::storage::Storage;
use crate::types::{CachedStrategy, StrategyMetadata, StrategyPerformance, StrategySource};

pub enum LookupOutcome {
    Hit { strategy: CachedStrategy, similarity: f64, confidence: f64 },
    Miss,
}

pub struct Cache {
    storage: Arc<Storage>,
    similarity_threshold: f64,
    max_entries: usize,
}

impl Cache {
    pub fn new(storage: Arc<Storage>, similarity_threshold: f64, max_entries: usize) -> Self {
        Self { storage, similarity_threshold, max_entries }
    }

    /// A hit requires similarity >= tau. On hit, the cached `selectedFiles`
    /// are returned unchanged; usage is incremented atomically. Cache
    /// errors are non-fatal — callers degrade to the next tier.
    pub async fn lookup(&self, signature: &RepoSignature, course_id: &str) -> LookupOutcome {
        let storage = Arc::clone(&self.storage);
        let course_id = course_id.to_string();
        let signature = signature.clone();
        let threshold = self.similarity_threshold;

        let result = tokio::task::spawn_blocking(move || {
            let candidates = storage.strategies_for_course(&course_id)?;
            let best = candidates
                .into_iter()
                .map(|strategy| {
                    let sim = core::similarity(&signature, &strategy.signature);
                    (strategy, sim)
                })
                .filter(|(_, sim)| *sim >= threshold)
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap());

            match best {
                Some((strategy, sim)) => {
                    storage.touch_usage(&strategy.id, Utc::now())?;
                    let confidence = core::confidence(sim, strategy.performance.success_rate, strategy.performance.usage_count + 1);
                    Ok::<_, rusqlite::Error>(Some((strategy, sim, confidence)))
                }
                None => Ok(None),
            }
        })
        .await;

        match result {
            Ok(Ok(Some((strategy, similarity, confidence)))) => {
                debug!(course_id, similarity, confidence, "cache hit");
                LookupOutcome::Hit { strategy, similarity, confidence }
            }
            Ok(Ok(None)) => LookupOutcome::Miss,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "cache lookup failed, degrading to miss");
                LookupOutcome::Miss
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache lookup task panicked, degrading to miss");
                LookupOutcome::Miss
            }
        }
    }

    /// Insert or update a strategy, keyed by a deterministic id derived
    /// from signature+course+source so repeated stores for the same input
    /// are idempotent. `source` distinguishes a real tenant evaluation from
    /// a warmer-seeded shape: it's folded into the id namespace so the two
    /// can never collide even when every other signature field matches.
    /// Evicts the LRU entry if at capacity.
    pub async fn store(
        &self,
        signature: &RepoSignature,
        course_id: &str,
        files: Vec<String>,
        perf: StrategyPerformance,
        source: StrategySource,
    ) -> Result<String, ApiError> {
        let storage = Arc::clone(&self.storage);
        let course_id = course_id.to_string();
        let signature = signature.clone();
        let max_entries = self.max_entries;

        let id = tokio::task::spawn_blocking(move || -> rusqlite::Result<String> {
            let id = core::signature_id(&signature, &course_id, source.namespace());
            storage.upsert_signature(&id, &course_id, &signature)?;

            if storage.get_strategy(&id)?.is_some() {
                storage.update_strategy_files(&id, &files)?;
                return Ok(id);
            }

            if storage.count_strategies()? >= max_entries {
                if let Some(evicted) = storage.evict_lru()? {
                    info!(evicted, "cache at capacity, evicted LRU strategy");
                }
            }

            let now = Utc::now();
            let strategy = CachedStrategy {
                id: id.clone(),
                signature: signature.clone(),
                course_id: course_id.clone(),
                selected_files: files,
                source,
                performance: StrategyPerformance { usage_count: 1, ..perf },
                metadata: StrategyMetadata { created_at: now, last_used: now, last_updated: now, version: 1 },
            };
            storage.insert_strategy(&strategy, &id)?;
            Ok(id)
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)?;

        Ok(id)
    }

    /// Blend a quality score into the running mean and recompute success
    /// rate. Never fatal to the caller — logged and swallowed on error.
    pub async fn record_outcome(&self, strategy_id: &str, success: bool, quality: Option<f64>) {
        let storage = Arc::clone(&self.storage);
        let strategy_id = strategy_id.to_string();
        let result = tokio::task::spawn_blocking(move || storage.record_outcome(&strategy_id, success, quality)).await;
        if let Ok(Err(e)) = result {
            tracing::warn!(error = %e, "failed to record cache outcome");
        }
    }

    pub async fn stats(&self) -> Result<(usize, u64, f64), ApiError> {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || storage.cache_stats())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(ApiError::from)
    }
}
