//! HTTP handlers for the external interfaces in §6.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::auth::AuthContext;
use crate::cache::Cache;
use crate::error::ApiError;
use crate::ledger::Ledger;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppContext {
    pub orchestrator: Arc<Orchestrator>,
    pub ledger: Arc<Ledger>,
    pub cache: Arc<Cache>,
    pub start_time: Instant,
}

#[derive(Debug, Deserialize)]
pub struct AdmitRequest {
    #[serde(rename = "commitUrl")]
    pub commit_url: String,
    #[serde(rename = "courseId")]
    pub course_id: String,
}

/// `POST /evaluations`
pub async fn admit_evaluation(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Json(body): Json<AdmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let evaluation = ctx.orchestrator.admit(&auth.user_id, auth.tier, &body.commit_url, &body.course_id).await?;
    Ok(Json(json!({ "evaluationId": evaluation.evaluation_id, "status": evaluation.status.as_str() })))
}

/// `GET /evaluations/{id}`
pub async fn get_evaluation(
    State(ctx): State<AppContext>,
    Path(evaluation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let evaluation = ctx.orchestrator.get(&evaluation_id)?;

    let body = if matches!(evaluation.status, crate::types::EvaluationStatus::Completed) {
        json!({
            "evaluationId": evaluation.evaluation_id,
            "status": evaluation.status.as_str(),
            "total": evaluation.total,
            "scores": evaluation.scores,
        })
    } else {
        json!({
            "evaluationId": evaluation.evaluation_id,
            "status": evaluation.status.as_str(),
            "errorTag": evaluation.error_tag,
        })
    };

    Ok(Json(body))
}

/// `GET /usage`
pub async fn get_usage(State(ctx): State<AppContext>, auth: AuthContext) -> Result<impl IntoResponse, ApiError> {
    let decision = ctx.ledger.can_evaluate(&auth.user_id, auth.tier).await?;
    Ok(Json(json!({
        "tier": decision.tier.as_str(),
        "used": decision.current_count,
        "limit": decision.limit,
        "resetAt": decision.reset_at.to_rfc3339(),
    })))
}

/// `GET /cache/stats` (internal)
pub async fn cache_stats(State(ctx): State<AppContext>) -> Result<impl IntoResponse, ApiError> {
    let (size, total_usage, average_confidence) = ctx.cache.stats().await?;
    let hit_rate = if total_usage > 0 { (total_usage - size as u64) as f64 / total_usage as f64 } else { 0.0 };
    Ok(Json(json!({
        "size": size,
        "totalUsage": total_usage,
        "averageConfidence": average_confidence,
        "hitRate": hit_rate.max(0.0),
    })))
}

/// `GET /health`
pub async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": ctx.start_time.elapsed().as_secs(),
    }))
}
