//! Evaluation Orchestrator (§4.7): the per-evaluation state machine driving
//! admit -> resolve course -> fingerprint -> select -> fetch -> grade ->
//! persist -> notify.

use chrono::Utc;
use regex::Regex;
use rubricforge_core::{compute_signature, CourseCatalog};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::Config;
use crate::error::ApiError;
use crate::fetcher::{AggregateBudget, FileContent, Fetcher};
use crate::ledger::Ledger;
use crate::model_client::ModelClient;
use crate::pipeline::SelectionPipeline;
use crate::storage::Storage;
use crate::types::{CommitRef, Evaluation, EvaluationScore, EvaluationStatus, StrategySource, Tier};

fn commit_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https://github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)/commit/([a-f0-9]{7,40})/?$")
            .unwrap()
    })
}

/// Sanitize and validate a commit URL per §6: strip surrounding
/// quotes/angles, reject dangerous schemes, then match the commit-pinned
/// pattern. Branch-tip URLs (`/tree/<branch>`, `/blob/<branch>/...`) are
/// rejected — branch tips move, which would make cache keys and repeated
/// evaluations unstable.
pub fn parse_commit_url(raw: &str) -> Result<CommitRef, ApiError> {
    let trimmed = raw.trim().trim_matches('"').trim_matches('\'').trim_start_matches('<').trim_end_matches('>');

    let lowered = trimmed.to_lowercase();
    if lowered.starts_with("javascript:") || lowered.starts_with("data:") || lowered.starts_with("vbscript:") {
        return Err(ApiError::InvalidInput("commit URL uses a disallowed scheme".to_string()));
    }

    let captures = commit_url_pattern()
        .captures(trimmed)
        .ok_or_else(|| ApiError::InvalidInput("commit URL must be a commit-pinned github.com URL".to_string()))?;

    Ok(CommitRef {
        owner: captures[1].to_string(),
        repo: captures[2].to_string(),
        commit_hash: captures[3].to_string(),
    })
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<Cache>,
    pipeline: Arc<SelectionPipeline>,
    model_client: Arc<dyn ModelClient>,
    ledger: Arc<Ledger>,
    catalog: Arc<CourseCatalog>,
    config: Arc<Config>,
    workers: Arc<AsyncMutex<JoinSet<()>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<Cache>,
        pipeline: Arc<SelectionPipeline>,
        model_client: Arc<dyn ModelClient>,
        ledger: Arc<Ledger>,
        catalog: Arc<CourseCatalog>,
        config: Arc<Config>,
    ) -> Self {
        Self { storage, fetcher, cache, pipeline, model_client, ledger, catalog, config, workers: Arc::new(AsyncMutex::new(JoinSet::new())) }
    }

    /// Admission: validate caller ownership, quota, and URL shape, then
    /// create a `pending` row and enqueue the worker. Returns immediately;
    /// the caller polls the result endpoint.
    pub async fn admit(&self, user_id: &str, tier: Tier, commit_url: &str, course_id: &str) -> Result<Evaluation, ApiError> {
        let decision = self.ledger.can_evaluate(user_id, tier).await?;
        if !decision.allowed {
            return Err(ApiError::QuotaExceeded { used: decision.current_count, limit: decision.limit });
        }

        let commit_ref = parse_commit_url(commit_url)?;
        self.catalog.get(course_id)?;

        let evaluation = Evaluation {
            evaluation_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            commit_ref,
            course_id: course_id.to_string(),
            status: EvaluationStatus::Pending,
            scores: Vec::new(),
            total: 0,
            started_at: Utc::now(),
            finished_at: None,
            error_tag: None,
        };

        self.storage.insert_evaluation(&evaluation)?;

        let this = self.clone_handles();
        let evaluation_id = evaluation.evaluation_id.clone();
        let tier_for_worker = decision.tier;
        self.workers.lock().await.spawn(async move {
            this.run(&evaluation_id, tier_for_worker).await;
        });

        Ok(evaluation)
    }

    /// Await every in-flight evaluation worker's current step. Called after
    /// the HTTP listener stops accepting connections so a shutdown never
    /// truncates a running evaluation mid-step.
    pub async fn drain(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "evaluation worker panicked during shutdown drain");
            }
        }
    }

    pub fn get(&self, evaluation_id: &str) -> Result<Evaluation, ApiError> {
        self.storage
            .get_evaluation(evaluation_id)?
            .ok_or_else(|| ApiError::NotFound(format!("evaluation {evaluation_id} not found")))
    }

    fn clone_handles(&self) -> Orchestrator {
        Orchestrator {
            storage: Arc::clone(&self.storage),
            fetcher: Arc::clone(&self.fetcher),
            cache: Arc::clone(&self.cache),
            pipeline: Arc::clone(&self.pipeline),
            model_client: Arc::clone(&self.model_client),
            ledger: Arc::clone(&self.ledger),
            catalog: Arc::clone(&self.catalog),
            config: Arc::clone(&self.config),
            workers: Arc::clone(&self.workers),
        }
    }

    /// The worker loop. Bounds the whole run at the per-evaluation deadline
    /// (default 5 min); on timeout the current step is abandoned and the
    /// evaluation fails with `Timeout` and no further side effects.
    async fn run(&self, evaluation_id: &str, tier: Tier) {
        let deadline = self.config.eval_deadline;
        match tokio::time::timeout(deadline, self.run_inner(evaluation_id, tier)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(evaluation_id, tier, e).await,
            Err(_) => self.fail(evaluation_id, tier, ApiError::Timeout).await,
        }
    }

    async fn run_inner(&self, evaluation_id: &str, tier: Tier) -> Result<(), ApiError> {
        let evaluation = self.get(evaluation_id)?;
        let course = self.catalog.get(&evaluation.course_id)?;

        self.storage.set_status(evaluation_id, EvaluationStatus::Selecting, None)?;

        let listing = self.fetcher.list_tree(&evaluation.commit_ref).await?;
        if listing.is_empty() {
            return Err(ApiError::InvalidInput("empty file listing".to_string()));
        }

        let key_basenames: Vec<String> = listing
            .iter()
            .filter(|p| {
                let base = p.rsplit('/').next().unwrap_or(p).to_lowercase();
                base.starts_with("readme") || base == "cargo.toml" || base == "package.json" || base == "requirements.txt"
            })
            .cloned()
            .collect();

        let signature = compute_signature(&course.course_id, &listing, &key_basenames, self.config.max_files_per_evaluation * 400)?;

        let selection = self.pipeline.select(&signature, course, &listing).await?;

        self.storage.set_status(evaluation_id, EvaluationStatus::Grading, None)?;

        let mut budget = AggregateBudget::new(self.config.max_aggregate_bytes);
        let mut files = Vec::with_capacity(selection.selected_files.len());
        for path in &selection.selected_files {
            match self.fetcher.get_file(&evaluation.commit_ref, path, &mut budget).await? {
                FileContent::Full(bytes) => {
                    files.push((path.clone(), String::from_utf8_lossy(&bytes).into_owned()));
                }
                FileContent::Truncated => {
                    files.push((path.clone(), "<truncated: exceeds per-file size cap>".to_string()));
                }
            }
        }

        let grade_items = self.model_client.grade(course, &files).await?;

        let mut scores = Vec::with_capacity(course.criteria.len());
        for criterion in &course.criteria {
            let item = grade_items.iter().find(|g| course.canonical_name(&g.criterion_name) == criterion.name);
            let (score, feedback, source_files) = match item {
                Some(g) => {
                    // Trust only files the model actually saw; an empty or
                    // fully-hallucinated citation falls back to the whole
                    // selection rather than persisting no evidence at all.
                    let cited: Vec<String> =
                        g.source_files.iter().filter(|f| selection.selected_files.contains(f)).cloned().collect();
                    let files = if cited.is_empty() { selection.selected_files.clone() } else { cited };
                    (g.score.min(criterion.max_score), g.feedback.clone(), files)
                }
                None => (0, "no evidence provided by grading model".to_string(), Vec::new()),
            };
            scores.push(EvaluationScore {
                criterion_name: criterion.name.clone(),
                score,
                max_score: criterion.max_score,
                feedback,
                source_files,
            });
        }

        if scores.len() != course.criteria.len() {
            return Err(ApiError::ParseFailure("criterion count mismatch after reconciliation".to_string()));
        }

        let total: u32 = scores.iter().map(|s| s.score).sum();
        let strategy_id = rubricforge_core::signature_id(&signature, &course.course_id, StrategySource::Tenant.namespace());

        self.storage.complete_evaluation(evaluation_id, &scores, total, Utc::now(), Some(&strategy_id))?;

        if matches!(selection.method, rubricforge_core::SelectionMethod::Cache) {
            let normalized = if course.max_total_score > 0 { total as f64 / course.max_total_score as f64 } else { 0.0 };
            self.cache.record_outcome(&strategy_id, true, Some(normalized)).await;
        }

        self.ledger.increment(&evaluation.user_id, tier).await?;

        info!(evaluation_id, total, method = selection.method.as_str(), "evaluation completed");
        Ok(())
    }

    async fn fail(&self, evaluation_id: &str, tier: Tier, err: ApiError) {
        error!(evaluation_id, error_tag = err.tag(), "evaluation failed");

        if let Err(e) = self.storage.fail_evaluation(evaluation_id, err.tag(), Utc::now()) {
            error!(evaluation_id, error = %e, "failed to persist evaluation failure");
            return;
        }

        if err.consumes_quota() {
            if let Ok(evaluation) = self.get(evaluation_id) {
                if let Err(e) = self.ledger.increment(&evaluation.user_id, tier).await {
                    warn!(evaluation_id, error = %e, "failed to increment usage after user-attributable failure");
                }
            }
        }
    }
}
