//! Quota & Usage Ledger (§4.8): per-user monthly evaluation counters with
//! tier limits, checked on admission and incremented on terminal decisions.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;
use crate::storage::Storage;
use crate::types::{Tier, UsageWindow};

const INCREMENT_MAX_ATTEMPTS: u32 = 3;

pub struct LedgerDecision {
    pub allowed: bool,
    pub current_count: u32,
    pub limit: i64,
    pub tier: Tier,
    pub reset_at: DateTime<Utc>,
}

pub struct Ledger {
    storage: Arc<Storage>,
}

fn month_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 { (now.year() + 1, 1) } else { (now.year(), now.month() + 1) };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

impl Ledger {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Resolve or create this month's window for `user_id`, rolling it
    /// forward first if `reset_at` has already passed (reset is idempotent:
    /// any increment after `resetAt` rolls the window forward first).
    async fn current_window(&self, user_id: &str, tier: Tier) -> Result<UsageWindow, ApiError> {
        let storage = Arc::clone(&self.storage);
        let user_id = user_id.to_string();
        let now = Utc::now();
        let month = month_key(now);
        let reset_at = next_month_start(now);

        tokio::task::spawn_blocking(move || -> Result<UsageWindow, rusqlite::Error> {
            if let Some(existing) = storage.get_usage_window(&user_id, &month)? {
                return Ok(existing);
            }
            let window = UsageWindow { user_id: user_id.clone(), month: month.clone(), evaluations_count: 0, tier, reset_at, version: 1 };
            storage.insert_usage_window(&window)?;
            storage.get_usage_window(&user_id, &month).map(|w| w.unwrap_or(window))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
    }

    /// `canEvaluate(userId) -> (allowed, currentCount, limit, tier)`.
    pub async fn can_evaluate(&self, user_id: &str, tier: Tier) -> Result<LedgerDecision, ApiError> {
        let window = self.current_window(user_id, tier).await?;
        let limit = window.tier.cap();
        let allowed = window.tier.is_unbounded() || (window.evaluations_count as i64) < limit;
        Ok(LedgerDecision {
            allowed,
            current_count: window.evaluations_count,
            limit,
            tier: window.tier,
            reset_at: window.reset_at,
        })
    }

    /// Optimistic-lock increment, bounded retry with exponential sleep.
    /// Quota idempotence: callers gate this on a status transition, not a
    /// local flag, so a replayed terminal transition never double-increments.
    pub async fn increment(&self, user_id: &str, tier: Tier) -> Result<(), ApiError> {
        for attempt in 1..=INCREMENT_MAX_ATTEMPTS {
            let window = self.current_window(user_id, tier).await?;
            let storage = Arc::clone(&self.storage);
            let user_id_owned = user_id.to_string();
            let month = window.month.clone();
            let version = window.version;

            let applied = tokio::task::spawn_blocking(move || storage.increment_usage_window(&user_id_owned, &month, version))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?
                .map_err(ApiError::from)?;

            if applied {
                return Ok(());
            }

            warn!(user_id, attempt, "usage window increment lost optimistic-lock race, retrying");
            tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
        }
        Err(ApiError::Internal("usage window increment failed after retries".to_string()))
    }

    /// Idempotent sweep: rolls every expired window forward. Running twice
    /// in a row has no effect after the first.
    pub async fn reset_expired(&self) -> Result<usize, ApiError> {
        let storage = Arc::clone(&self.storage);
        let now = Utc::now();
        let new_month = month_key(now);
        let new_reset_at = next_month_start(now);
        tokio::task::spawn_blocking(move || storage.reset_expired_windows(now, &new_month, new_reset_at))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(ApiError::from)
    }
}
