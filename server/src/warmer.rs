//! Cache Warmer (§4.6): periodically seeds the cache with selections for
//! known recurring repository shapes, so a tenant's first real evaluation
//! for a common course shape can still hit the cache.

use rubricforge_core::{compute_signature, CourseCatalog};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::pipeline::SelectionPipeline;
use crate::storage::Storage;
use crate::types::{StrategyPerformance, StrategySource};

/// Prefix used for synthetic warmer-generated strategies, so they never
/// collide with a real tenant's signature namespace. Kept in lockstep with
/// `StrategySource::Synthetic::namespace()`, which is what actually gets
/// folded into the cache key.
pub const SYNTHETIC_MARKER: &str = StrategySource::Synthetic.namespace();

/// A known recurring repository shape for a course, warmed proactively.
#[derive(Debug, Clone)]
pub struct RepoShape {
    pub name: String,
    pub course_id: String,
    pub canonical_files: Vec<String>,
    /// Warm cycles per day; 1.0 means re-warm once every 24h.
    pub frequency: f64,
}

pub struct CacheWarmer {
    cache: Arc<Cache>,
    storage: Arc<Storage>,
    catalog: Arc<CourseCatalog>,
    pipeline: Arc<SelectionPipeline>,
    shapes: Vec<RepoShape>,
}

impl CacheWarmer {
    pub fn new(
        cache: Arc<Cache>,
        storage: Arc<Storage>,
        catalog: Arc<CourseCatalog>,
        pipeline: Arc<SelectionPipeline>,
        shapes: Vec<RepoShape>,
    ) -> Self {
        Self { cache, storage, catalog, pipeline, shapes }
    }

    /// Spawn the periodic warming task. Warming is advisory: failures are
    /// logged and never propagate to live request handling.
    pub fn spawn(self: Arc<Self>, tick: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                self.run_cycle().await;
            }
        })
    }

    async fn run_cycle(&self) {
        for shape in &self.shapes {
            if let Err(e) = self.warm_shape(shape).await {
                warn!(shape = shape.name, error = %e, "cache warmer cycle failed for shape");
            }
        }
    }

    async fn warm_shape(&self, shape: &RepoShape) -> Result<(), String> {
        let course = self.catalog.get(&shape.course_id).map_err(|e| e.to_string())?;

        let signature = compute_signature(&course.course_id, &shape.canonical_files, &shape.canonical_files, 20_000)
            .map_err(|e| e.to_string())?;

        let id = rubricforge_core::signature_id(&signature, &course.course_id, StrategySource::Synthetic.namespace());
        let threshold = Duration::from_secs_f64(86_400.0 / shape.frequency.max(0.01));

        let storage = Arc::clone(&self.storage);
        let id_for_check = id.clone();
        let existing = tokio::task::spawn_blocking(move || storage.get_strategy(&id_for_check))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;

        if let Some(strategy) = &existing {
            let age = chrono::Utc::now().signed_duration_since(strategy.metadata.last_updated);
            if age.to_std().map(|a| a < threshold).unwrap_or(false) {
                return Ok(());
            }
        }

        let selection = self
            .pipeline
            .select(&signature, course, &shape.canonical_files)
            .await
            .map_err(|e| e.to_string())?;

        let perf = StrategyPerformance { usage_count: 1, ..Default::default() };
        self.cache
            .store(&signature, &course.course_id, selection.selected_files, perf, StrategySource::Synthetic)
            .await
            .map_err(|e| e.to_string())?;

        info!(shape = shape.name, marker = SYNTHETIC_MARKER, "warmed cache for repository shape");
        Ok(())
    }
}
