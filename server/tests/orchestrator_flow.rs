//! End-to-end admit -> select -> grade -> persist flow, and the cache
//! hit/miss behavior across two evaluations of the same repository shape.

mod helpers;

use helpers::{build_test_env, wait_for_terminal, FakeFetcher, FakeModelClient};
use rubricforge_server::model_client::GradeItem;
use rubricforge_server::types::{EvaluationStatus, Tier};
use std::collections::HashMap;

fn sample_listing() -> Vec<String> {
    vec![
        "README.md".to_string(),
        "dbt_project.yml".to_string(),
        "dbt/models/staging/stg_orders.sql".to_string(),
        "src/pipeline/orchestrate.py".to_string(),
    ]
}

fn full_scores() -> Vec<GradeItem> {
    vec![
        GradeItem {
            criterion_name: "Transformations".to_string(),
            score: 10,
            feedback: "solid dbt layer".to_string(),
            source_files: vec!["dbt/models/staging/stg_orders.sql".to_string()],
        },
        GradeItem {
            criterion_name: "Orchestration".to_string(),
            score: 8,
            feedback: "pipeline present".to_string(),
            source_files: vec!["src/pipeline/orchestrate.py".to_string()],
        },
    ]
}

#[tokio::test]
async fn first_evaluation_rule_based_second_hits_cache() {
    let fetcher = FakeFetcher { listing: sample_listing(), contents: HashMap::new() };
    let model = FakeModelClient::new(vec![], full_scores());
    let env = build_test_env(fetcher, model);

    let first = env
        .orchestrator
        .admit("user-1", Tier::Free, "https://github.com/acme/repo/commit/abc1234", "mlops")
        .await
        .unwrap();
    let first = wait_for_terminal(&env, &first.evaluation_id).await;
    assert_eq!(first.status, EvaluationStatus::Completed);
    assert_eq!(first.total, 18);

    let (size, total_usage, _) = env.cache.stats().await.unwrap();
    assert_eq!(size, 1);
    assert_eq!(total_usage, 1);

    let second = env
        .orchestrator
        .admit("user-1", Tier::Free, "https://github.com/acme/repo/commit/def5678", "mlops")
        .await
        .unwrap();
    let second = wait_for_terminal(&env, &second.evaluation_id).await;
    assert_eq!(second.status, EvaluationStatus::Completed);

    let (size_after, total_usage_after, _) = env.cache.stats().await.unwrap();
    assert_eq!(size_after, 1, "second evaluation of an identical shape reuses the cached strategy");
    assert_eq!(total_usage_after, 2);
}

#[tokio::test]
async fn completed_scores_carry_distinct_per_criterion_source_files() {
    let fetcher = FakeFetcher { listing: sample_listing(), contents: HashMap::new() };
    let model = FakeModelClient::new(vec![], full_scores());
    let env = build_test_env(fetcher, model);

    let evaluation = env
        .orchestrator
        .admit("user-1", Tier::Free, "https://github.com/acme/repo/commit/abc1234", "mlops")
        .await
        .unwrap();
    let evaluation = wait_for_terminal(&env, &evaluation.evaluation_id).await;

    let transformations = evaluation.scores.iter().find(|s| s.criterion_name == "Transformations").unwrap();
    let orchestration = evaluation.scores.iter().find(|s| s.criterion_name == "Orchestration").unwrap();

    assert_eq!(transformations.source_files, vec!["dbt/models/staging/stg_orders.sql".to_string()]);
    assert_eq!(orchestration.source_files, vec!["src/pipeline/orchestrate.py".to_string()]);
    assert_ne!(transformations.source_files, orchestration.source_files);
}

#[tokio::test]
async fn quota_exhausted_after_tier_cap() {
    let fetcher = FakeFetcher { listing: sample_listing(), contents: HashMap::new() };
    let model = FakeModelClient::new(vec![], full_scores());
    let env = build_test_env(fetcher, model);

    for _ in 0..4 {
        let evaluation = env
            .orchestrator
            .admit("user-free", Tier::Free, "https://github.com/acme/repo/commit/abc1234", "mlops")
            .await
            .unwrap();
        wait_for_terminal(&env, &evaluation.evaluation_id).await;
    }

    let err = env
        .orchestrator
        .admit("user-free", Tier::Free, "https://github.com/acme/repo/commit/abc1234", "mlops")
        .await
        .unwrap_err();
    assert!(matches!(err, rubricforge_server::error::ApiError::QuotaExceeded { used: 4, limit: 4 }));
}

#[tokio::test]
async fn branch_tip_url_is_rejected() {
    let fetcher = FakeFetcher { listing: sample_listing(), contents: HashMap::new() };
    let model = FakeModelClient::new(vec![], full_scores());
    let env = build_test_env(fetcher, model);

    let err = env
        .orchestrator
        .admit("user-1", Tier::Free, "https://github.com/acme/repo/tree/main", "mlops")
        .await
        .unwrap_err();
    assert!(matches!(err, rubricforge_server::error::ApiError::InvalidInput(_)));
}

#[tokio::test]
async fn usage_decision_reports_reset_at() {
    let fetcher = FakeFetcher { listing: sample_listing(), contents: HashMap::new() };
    let model = FakeModelClient::new(vec![], full_scores());
    let env = build_test_env(fetcher, model);

    let decision = env.ledger.can_evaluate("user-1", Tier::Free).await.unwrap();
    assert!(decision.reset_at > chrono::Utc::now());
}

#[tokio::test]
async fn unknown_course_is_rejected_at_admission() {
    let fetcher = FakeFetcher { listing: sample_listing(), contents: HashMap::new() };
    let model = FakeModelClient::new(vec![], full_scores());
    let env = build_test_env(fetcher, model);

    let err = env
        .orchestrator
        .admit("user-1", Tier::Free, "https://github.com/acme/repo/commit/abc1234", "nonexistent")
        .await
        .unwrap_err();
    assert!(matches!(err, rubricforge_server::error::ApiError::InvalidInput(_)));

    let _ = env.ledger.can_evaluate("user-1", Tier::Free).await.unwrap();
}
