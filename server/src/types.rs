//! Domain types for evaluations, usage windows, and cached strategies —
//! the server-side shapes backing the tables in §6.

use chrono::{DateTime, Utc};
use rubricforge_core::RepoSignature;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Commit reference
// ---------------------------------------------------------------------------

/// `(owner, repo, commitHash)`. The commit is the immutable unit of
/// evaluation — branch names are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub owner: String,
    pub repo: String,
    pub commit_hash: String,
}

impl CommitRef {
    pub fn tree_url(&self, api_base: &str) -> String {
        format!(
            "{api_base}/repos/{}/{}/git/trees/{}?recursive=1",
            self.owner, self.repo, self.commit_hash
        )
    }

    pub fn raw_file_url(&self, api_base: &str, path: &str) -> String {
        format!(
            "{api_base}/repos/{}/{}/contents/{}?ref={}",
            self.owner, self.repo, path, self.commit_hash
        )
    }
}

// ---------------------------------------------------------------------------
// Subscription tier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    /// Monthly cap; `-1` denotes unbounded.
    pub fn cap(&self) -> i64 {
        match self {
            Tier::Free => 4,
            Tier::Starter => 5,
            Tier::Pro => 6,
            Tier::Enterprise => -1,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.cap() < 0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(Tier::Free),
            "starter" => Some(Tier::Starter),
            "pro" => Some(Tier::Pro),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Selecting,
    Grading,
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Selecting => "selecting",
            EvaluationStatus::Grading => "grading",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EvaluationStatus::Pending),
            "selecting" => Some(EvaluationStatus::Selecting),
            "grading" => Some(EvaluationStatus::Grading),
            "completed" => Some(EvaluationStatus::Completed),
            "failed" => Some(EvaluationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationScore {
    pub criterion_name: String,
    pub score: u32,
    pub max_score: u32,
    pub feedback: String,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub evaluation_id: String,
    pub user_id: String,
    pub commit_ref: CommitRef,
    pub course_id: String,
    pub status: EvaluationStatus,
    pub scores: Vec<EvaluationScore>,
    pub total: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_tag: Option<String>,
}

// ---------------------------------------------------------------------------
// Usage window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageWindow {
    pub user_id: String,
    pub month: String, // YYYY-MM UTC
    pub evaluations_count: u32,
    pub tier: Tier,
    pub reset_at: DateTime<Utc>,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Cached strategy
// ---------------------------------------------------------------------------

/// Whether a cached strategy came from a real evaluation or the cache
/// warmer. Folded into the strategy's id namespace so a warmer-seeded
/// shape can never collide with (and silently overwrite) a tenant's
/// cached strategy that happens to share the same signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategySource {
    Tenant,
    Synthetic,
}

impl StrategySource {
    pub const fn namespace(&self) -> &'static str {
        match self {
            StrategySource::Tenant => "",
            StrategySource::Synthetic => "synthetic://",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategySource::Tenant => "tenant",
            StrategySource::Synthetic => "synthetic",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "synthetic" => StrategySource::Synthetic,
            _ => StrategySource::Tenant,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub accuracy: f64,
    pub processing_time_ms: u64,
    pub evaluation_quality: f64,
    pub usage_count: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedStrategy {
    pub id: String,
    pub signature: RepoSignature,
    pub course_id: String,
    pub selected_files: Vec<String>,
    pub source: StrategySource,
    pub performance: StrategyPerformance,
    pub metadata: StrategyMetadata,
}

