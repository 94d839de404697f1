//! Grading model client (§4.3/§5): an Anthropic-Messages-shaped HTTP client
//! used both for Tier 3 file-selection assistance and for the orchestrator's
//! grading call. Request/response shape and the "extract the JSON object"
//! parsing strategy are grounded in the pack's `ApiSupervisor`.

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use rubricforge_core::Course;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;

const MAX_ATTEMPTS: u32 = 3;
const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeItem {
    pub criterion_name: String,
    pub score: u32,
    pub feedback: String,
    /// Files the model cited as evidence for this criterion specifically.
    /// Empty when the model didn't (or couldn't) attribute per-criterion —
    /// callers fall back to the full selection in that case.
    pub source_files: Vec<String>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Tier 3: given the pruned listing and the course's criteria, return a
    /// candidate file list. The caller intersects this with the real
    /// listing and re-applies the guardrail filter.
    async fn select_files(&self, listing: &[String], course: &Course) -> Result<Vec<String>, ApiError>;

    /// Grading call: given the course and the selected files' content,
    /// return one `GradeItem` per criterion touched by the model. Labels
    /// are reconciled to canonical names by the caller (§9).
    async fn grade(&self, course: &Course, files: &[(String, String)]) -> Result<Vec<GradeItem>, ApiError>;
}

pub struct AnthropicModelClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl AnthropicModelClient {
    pub fn new(api_base: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), api_base, api_key, model: "claude-sonnet-4-5".to_string() }
    }

    async fn send_message(&self, system: &str, user: &str) -> Result<String, ApiError> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = self
                .client
                .post(&self.api_base)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body);

            let response = tokio::time::timeout(MODEL_CALL_TIMEOUT, request.send()).await;

            match response {
                Ok(Ok(resp)) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ApiError::RateLimited);
                    }
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(1);
                    warn!(attempt, retry_after, "model client rate limited, retrying");
                    jittered_sleep(retry_after).await;
                }
                Ok(Ok(resp)) if resp.status().is_server_error() && attempt < MAX_ATTEMPTS => {
                    warn!(status = %resp.status(), attempt, "model client retrying after server error");
                    jittered_sleep(attempt as u64) .await;
                }
                Ok(Ok(resp)) if resp.status().is_success() => {
                    let parsed: AnthropicResponse =
                        resp.json().await.map_err(|e| ApiError::ParseFailure(e.to_string()))?;
                    let text = parsed
                        .content
                        .into_iter()
                        .find_map(|block| block.text)
                        .ok_or_else(|| ApiError::ParseFailure("empty model response".to_string()))?;
                    return Ok(text);
                }
                Ok(Ok(resp)) => {
                    return Err(ApiError::UpstreamUnavailable(format!("model returned {}", resp.status())));
                }
                Ok(Err(e)) => return Err(ApiError::UpstreamUnavailable(e.to_string())),
                Err(_) => return Err(ApiError::Timeout),
            }
        }
    }
}

async fn jittered_sleep(base_secs: u64) {
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..500);
    tokio::time::sleep(Duration::from_secs(base_secs) + Duration::from_millis(jitter_ms)).await;
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

/// Extract the JSON object between the first `{` and the last `}` in a
/// free-text model response. Models wrap JSON in prose despite
/// instructions; this is the pragmatic fix the pack's supervisor uses too.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[async_trait]
impl ModelClient for AnthropicModelClient {
    async fn select_files(&self, listing: &[String], course: &Course) -> Result<Vec<String>, ApiError> {
        let criteria_desc: Vec<String> = course
            .criteria
            .iter()
            .map(|c| format!("- {} (evidence: {})", c.name, c.evidence_hints.join(", ")))
            .collect();

        let system = "You select the minimal set of source files that provide evidence for a grading rubric. Respond with a JSON object: {\"files\": [\"path\", ...]}.";
        let user = format!(
            "Course: {}\nCriteria:\n{}\n\nFile listing:\n{}",
            course.display_name,
            criteria_desc.join("\n"),
            listing.join("\n")
        );

        let raw = self.send_message(system, &user).await?;
        let json_slice = extract_json_object(&raw)
            .ok_or_else(|| ApiError::ParseFailure("no JSON object in model response".to_string()))?;

        #[derive(Deserialize)]
        struct FilesPayload {
            files: Vec<String>,
        }
        let payload: FilesPayload =
            serde_json::from_str(json_slice).map_err(|e| ApiError::ParseFailure(e.to_string()))?;
        Ok(payload.files)
    }

    async fn grade(&self, course: &Course, files: &[(String, String)]) -> Result<Vec<GradeItem>, ApiError> {
        let criteria_desc: Vec<String> = course
            .criteria
            .iter()
            .map(|c| format!("- {} (max {})", c.name, c.max_score))
            .collect();

        let file_blocks: Vec<String> =
            files.iter().map(|(path, content)| format!("<file path=\"{path}\">\n{content}\n</file>")).collect();

        let system = "You are grading a student repository against a rubric. For each criterion, cite the specific files that justify the score. Respond with a JSON object: {\"scores\": [{\"criterionName\": \"...\", \"score\": N, \"feedback\": \"...\", \"sourceFiles\": [\"path\", ...]}]}.";
        let user = format!(
            "Course: {}\nCriteria:\n{}\n\nFiles:\n{}",
            course.display_name,
            criteria_desc.join("\n"),
            file_blocks.join("\n\n")
        );

        let raw = self.send_message(system, &user).await?;
        let json_slice = extract_json_object(&raw)
            .ok_or_else(|| ApiError::ParseFailure("no JSON object in model response".to_string()))?;

        #[derive(Deserialize)]
        struct ScoreEntry {
            #[serde(rename = "criterionName")]
            criterion_name: String,
            score: u32,
            feedback: String,
            #[serde(rename = "sourceFiles", default)]
            source_files: Vec<String>,
        }
        #[derive(Deserialize)]
        struct ScoresPayload {
            scores: Vec<ScoreEntry>,
        }
        let payload: ScoresPayload =
            serde_json::from_str(json_slice).map_err(|e| ApiError::ParseFailure(e.to_string()))?;

        Ok(payload
            .scores
            .into_iter()
            .map(|s| GradeItem {
                criterion_name: s.criterion_name,
                score: s.score,
                feedback: s.feedback,
                source_files: s.source_files,
            })
            .collect())
    }
}
