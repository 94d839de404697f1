//! Repository Fetcher (§4.3): commit-pinned tree listing and file content,
//! with guardrail filtering, per-file and aggregate size caps, and retried
//! network calls.

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use rubricforge_core::filter_guardrail;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;
use crate::types::CommitRef;

const MAX_ATTEMPTS: u32 = 3;
const CALL_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Full(Vec<u8>),
    /// Larger than the per-file cap — returned as a sentinel, not read.
    Truncated,
}

/// Tracks the aggregate bytes fetched for a single evaluation. Per-file, not
/// global — a fresh budget is created per evaluation.
pub struct AggregateBudget {
    consumed: u64,
    cap: u64,
}

impl AggregateBudget {
    pub fn new(cap: u64) -> Self {
        Self { consumed: 0, cap }
    }

    fn charge(&mut self, bytes: u64) -> Result<(), ApiError> {
        if self.consumed + bytes > self.cap {
            return Err(ApiError::BudgetExhausted);
        }
        self.consumed += bytes;
        Ok(())
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn list_tree(&self, commit: &CommitRef) -> Result<Vec<String>, ApiError>;

    async fn get_file(
        &self,
        commit: &CommitRef,
        path: &str,
        budget: &mut AggregateBudget,
    ) -> Result<FileContent, ApiError>;
}

pub struct GithubFetcher {
    client: reqwest::Client,
    api_base: String,
    max_file_bytes: u64,
}

impl GithubFetcher {
    pub fn new(api_base: String, max_file_bytes: u64) -> Self {
        Self { client: reqwest::Client::new(), api_base, max_file_bytes }
    }

    /// Exponential backoff with jitter, capped at `MAX_ATTEMPTS`. 404 is
    /// never retried. Transient network errors and 5xx responses are.
    async fn send_with_retry(&self, url: &str) -> Result<reqwest::Response, ApiError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(CALL_BUDGET, self.client.get(url).send()).await;

            match result {
                Ok(Ok(resp)) if resp.status() == StatusCode::NOT_FOUND => {
                    return Err(ApiError::NotFound(format!("{url} not found")));
                }
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(resp),
                Ok(Ok(resp)) if resp.status().is_server_error() && attempt < MAX_ATTEMPTS => {
                    warn!(status = %resp.status(), attempt, url, "fetcher retrying after server error");
                    backoff_sleep(attempt).await;
                }
                Ok(Ok(resp)) if resp.status().is_server_error() => {
                    return Err(ApiError::UpstreamUnavailable(format!(
                        "{url} returned {}",
                        resp.status()
                    )));
                }
                Ok(Ok(resp)) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    return Err(ApiError::RateLimited);
                }
                Ok(Ok(resp)) => {
                    return Err(ApiError::UpstreamUnavailable(format!(
                        "{url} returned {}",
                        resp.status()
                    )));
                }
                Ok(Err(e)) if attempt < MAX_ATTEMPTS => {
                    warn!(error = %e, attempt, url, "fetcher retrying after transport error");
                    backoff_sleep(attempt).await;
                }
                Ok(Err(e)) => return Err(ApiError::UpstreamUnavailable(e.to_string())),
                Err(_) => return Err(ApiError::Timeout),
            }
        }
    }
}

async fn backoff_sleep(attempt: u32) {
    let base_ms = 200u64 * 2u64.pow(attempt - 1);
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..=base_ms / 2);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: Option<String>,
    encoding: Option<String>,
    size: u64,
}

#[async_trait]
impl Fetcher for GithubFetcher {
    async fn list_tree(&self, commit: &CommitRef) -> Result<Vec<String>, ApiError> {
        let url = commit.tree_url(&self.api_base);
        let resp = self.send_with_retry(&url).await?;
        let body: TreeResponse =
            resp.json().await.map_err(|e| ApiError::UpstreamUnavailable(e.to_string()))?;

        let paths: Vec<String> =
            body.tree.into_iter().filter(|e| e.kind == "blob").map(|e| e.path).collect();
        Ok(filter_guardrail(&paths))
    }

    async fn get_file(
        &self,
        commit: &CommitRef,
        path: &str,
        budget: &mut AggregateBudget,
    ) -> Result<FileContent, ApiError> {
        let url = commit.raw_file_url(&self.api_base, path);
        let resp = self.send_with_retry(&url).await?;
        let body: ContentsResponse =
            resp.json().await.map_err(|e| ApiError::UpstreamUnavailable(e.to_string()))?;

        if body.size > self.max_file_bytes {
            return Ok(FileContent::Truncated);
        }

        budget.charge(body.size)?;

        let raw = body.content.unwrap_or_default();
        let bytes = match body.encoding.as_deref() {
            Some("base64") => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(raw.replace('\n', ""))
                    .map_err(|e| ApiError::UpstreamUnavailable(e.to_string()))?
            }
            _ => raw.into_bytes(),
        };
        Ok(FileContent::Full(bytes))
    }
}
