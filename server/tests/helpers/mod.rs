//! Test harness: an in-memory `Storage` plus fake `Fetcher`/`ModelClient`
//! implementations, so integration tests never reach the network.

use async_trait::async_trait;
use rubricforge_core::{Course, Criterion};
use rubricforge_server::cache::Cache;
use rubricforge_server::config::Config;
use rubricforge_server::error::ApiError;
use rubricforge_server::fetcher::{AggregateBudget, FileContent, Fetcher};
use rubricforge_server::ledger::Ledger;
use rubricforge_server::model_client::{GradeItem, ModelClient};
use rubricforge_server::orchestrator::Orchestrator;
use rubricforge_server::pipeline::{CacheTier, FallbackTier, LlmAssistedTier, RuleBasedTier, SelectionPipeline};
use rubricforge_server::storage::Storage;
use rubricforge_server::types::CommitRef;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// A fixed repository tree served to every commit — tests don't exercise
/// multiple repos, only multiple course/signature combinations.
pub struct FakeFetcher {
    pub listing: Vec<String>,
    pub contents: HashMap<String, String>,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn list_tree(&self, _commit: &CommitRef) -> Result<Vec<String>, ApiError> {
        Ok(rubricforge_core::filter_guardrail(&self.listing))
    }

    async fn get_file(&self, _commit: &CommitRef, path: &str, _budget: &mut AggregateBudget) -> Result<FileContent, ApiError> {
        let body = self.contents.get(path).cloned().unwrap_or_default();
        Ok(FileContent::Full(body.into_bytes()))
    }
}

/// Canned grading model: returns a fixed file selection for Tier 3 and a
/// fixed score list for grading, unless configured to fail.
pub struct FakeModelClient {
    pub select_result: AsyncMutex<Vec<String>>,
    pub scores: AsyncMutex<Vec<GradeItem>>,
    pub fail_selection: bool,
}

impl FakeModelClient {
    pub fn new(select_result: Vec<String>, scores: Vec<GradeItem>) -> Self {
        Self { select_result: AsyncMutex::new(select_result), scores: AsyncMutex::new(scores), fail_selection: false }
    }
}

#[async_trait]
impl ModelClient for FakeModelClient {
    async fn select_files(&self, _listing: &[String], _course: &Course) -> Result<Vec<String>, ApiError> {
        if self.fail_selection {
            return Err(ApiError::UpstreamUnavailable("fake model unavailable".to_string()));
        }
        Ok(self.select_result.lock().await.clone())
    }

    async fn grade(&self, _course: &Course, _files: &[(String, String)]) -> Result<Vec<GradeItem>, ApiError> {
        Ok(self.scores.lock().await.clone())
    }
}

pub fn sample_course() -> Course {
    Course {
        course_id: "mlops".to_string(),
        display_name: "MLOps Fundamentals".to_string(),
        max_total_score: 20,
        criteria: vec![
            Criterion {
                name: "Transformations".to_string(),
                max_score: 10,
                evidence_hints: vec!["dbt/".to_string(), "*.sql".to_string()],
                aliases: vec![],
            },
            Criterion {
                name: "Orchestration".to_string(),
                max_score: 10,
                evidence_hints: vec!["src/pipeline/".to_string()],
                aliases: vec![],
            },
        ],
    }
}

pub struct TestEnv {
    pub orchestrator: Arc<Orchestrator>,
    pub storage: Arc<Storage>,
    pub cache: Arc<Cache>,
    pub ledger: Arc<Ledger>,
}

/// Assemble an orchestrator wired to an in-memory database and the fakes
/// above, with a single course ("mlops") preloaded.
pub fn build_test_env(fetcher: FakeFetcher, model_client: FakeModelClient) -> TestEnv {
    let storage = Arc::new(Storage::in_memory().expect("in-memory sqlite"));
    let catalog = Arc::new(rubricforge_core::CourseCatalog::new(vec![sample_course()]).unwrap());
    let cache = Arc::new(Cache::new(Arc::clone(&storage), 0.8, 10_000));
    let ledger = Arc::new(Ledger::new(Arc::clone(&storage)));
    let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);
    let model_client: Arc<dyn ModelClient> = Arc::new(model_client);

    let tiers: Vec<Box<dyn rubricforge_server::pipeline::CascadeTier>> = vec![
        Box::new(CacheTier::new(Arc::clone(&cache))),
        Box::new(RuleBasedTier::new(Arc::clone(&cache), 0.8)),
        Box::new(LlmAssistedTier::new(Arc::clone(&model_client))),
        Box::new(FallbackTier),
    ];
    let pipeline = Arc::new(SelectionPipeline::new(tiers, 50));

    let mut config = Config::from_env();
    config.eval_deadline = Duration::from_secs(5);
    let config = Arc::new(config);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&storage),
        fetcher,
        Arc::clone(&cache),
        pipeline,
        model_client,
        Arc::clone(&ledger),
        catalog,
        config,
    ));

    TestEnv { orchestrator, storage, cache, ledger }
}

/// Poll `get` until the evaluation leaves the working states or the attempt
/// budget is exhausted.
pub async fn wait_for_terminal(env: &TestEnv, evaluation_id: &str) -> rubricforge_server::types::Evaluation {
    for _ in 0..200 {
        let evaluation = env.orchestrator.get(evaluation_id).expect("evaluation exists");
        if matches!(
            evaluation.status,
            rubricforge_server::types::EvaluationStatus::Completed | rubricforge_server::types::EvaluationStatus::Failed
        ) {
            return evaluation;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("evaluation {evaluation_id} did not reach a terminal state in time");
}
