//! A completed evaluation must stay completed even if a caller later tries
//! to fail it (e.g. a quota increment that fails after scores are already
//! persisted).

use chrono::Utc;
use rubricforge_server::storage::Storage;
use rubricforge_server::types::{CommitRef, Evaluation, EvaluationScore, EvaluationStatus};

fn pending_evaluation(evaluation_id: &str) -> Evaluation {
    Evaluation {
        evaluation_id: evaluation_id.to_string(),
        user_id: "user-1".to_string(),
        commit_ref: CommitRef { owner: "acme".to_string(), repo: "repo".to_string(), commit_hash: "abc1234".to_string() },
        course_id: "mlops".to_string(),
        status: EvaluationStatus::Pending,
        scores: Vec::new(),
        total: 0,
        started_at: Utc::now(),
        finished_at: None,
        error_tag: None,
    }
}

#[test]
fn fail_evaluation_does_not_regress_a_completed_row() {
    let storage = Storage::in_memory().unwrap();
    storage.insert_evaluation(&pending_evaluation("eval-1")).unwrap();

    let scores = vec![EvaluationScore {
        criterion_name: "Transformations".to_string(),
        score: 10,
        max_score: 10,
        feedback: "solid dbt layer".to_string(),
        source_files: vec!["dbt/models/staging/stg_orders.sql".to_string()],
    }];
    storage.complete_evaluation("eval-1", &scores, 10, Utc::now(), Some("strategy-1")).unwrap();

    storage.fail_evaluation("eval-1", "internal", Utc::now()).unwrap();

    let reloaded = storage.get_evaluation("eval-1").unwrap().unwrap();
    assert_eq!(reloaded.status, EvaluationStatus::Completed);
    assert_eq!(reloaded.scores.len(), 1);
}

#[test]
fn fail_evaluation_still_applies_to_a_pending_row() {
    let storage = Storage::in_memory().unwrap();
    storage.insert_evaluation(&pending_evaluation("eval-2")).unwrap();

    storage.fail_evaluation("eval-2", "timeout", Utc::now()).unwrap();

    let reloaded = storage.get_evaluation("eval-2").unwrap().unwrap();
    assert_eq!(reloaded.status, EvaluationStatus::Failed);
    assert_eq!(reloaded.error_tag.as_deref(), Some("timeout"));
}
