//! SQLite-backed persistence for evaluations, cached strategies, repository
//! signatures, and usage windows — the tables named in §6.
//!
//! A single connection behind a mutex, driven from async call sites via
//! `tokio::task::spawn_blocking`. rusqlite gives us no async story of its
//! own, so every query hops onto a blocking thread rather than holding up
//! the runtime.

use chrono::{DateTime, Utc};
use rubricforge_core::{RepoSignature, SizeCategory};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use crate::types::{
    CachedStrategy, CommitRef, Evaluation, EvaluationScore, EvaluationStatus, StrategyMetadata,
    StrategyPerformance, StrategySource, Tier, UsageWindow,
};

pub struct Storage {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS evaluations (
    evaluation_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    commit_owner TEXT NOT NULL,
    commit_repo TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    course_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error_tag TEXT,
    strategy_id TEXT,
    total INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS evaluation_scores (
    evaluation_id TEXT NOT NULL REFERENCES evaluations(evaluation_id),
    criterion_name TEXT NOT NULL,
    score INTEGER NOT NULL,
    max_score INTEGER NOT NULL,
    feedback TEXT NOT NULL,
    source_files TEXT NOT NULL,
    ord INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS repository_signatures (
    id TEXT PRIMARY KEY,
    course_id TEXT NOT NULL,
    pattern_hash TEXT NOT NULL,
    technologies TEXT NOT NULL,
    directory_structure TEXT NOT NULL,
    size_category TEXT NOT NULL,
    file_types TEXT NOT NULL,
    first_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cached_strategies (
    id TEXT PRIMARY KEY,
    signature_id TEXT NOT NULL REFERENCES repository_signatures(id),
    course_id TEXT NOT NULL,
    selected_files TEXT NOT NULL,
    perf_accuracy REAL NOT NULL,
    perf_processing_time_ms INTEGER NOT NULL,
    perf_evaluation_quality REAL NOT NULL,
    usage_count INTEGER NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    success_rate REAL NOT NULL,
    source TEXT NOT NULL DEFAULT 'tenant',
    created_at TEXT NOT NULL,
    last_used TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cached_strategies_course ON cached_strategies(course_id);

CREATE TABLE IF NOT EXISTS user_usage (
    user_id TEXT NOT NULL,
    month TEXT NOT NULL,
    evaluations_count INTEGER NOT NULL,
    subscription_tier TEXT NOT NULL,
    reset_at TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (user_id, month)
);
"#;

impl Storage {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // -- evaluations ---------------------------------------------------

    pub fn insert_evaluation(&self, eval: &Evaluation) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO evaluations (evaluation_id, user_id, commit_owner, commit_repo, commit_hash,
                course_id, status, started_at, finished_at, error_tag, total)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                eval.evaluation_id,
                eval.user_id,
                eval.commit_ref.owner,
                eval.commit_ref.repo,
                eval.commit_ref.commit_hash,
                eval.course_id,
                eval.status.as_str(),
                eval.started_at.to_rfc3339(),
                eval.finished_at.map(|t| t.to_rfc3339()),
                eval.error_tag,
                eval.total,
            ],
        )?;
        Ok(())
    }

    /// Advance status. Callers are responsible for ensuring transitions are
    /// sequential per evaluation (§5) — this does not itself enforce an
    /// ordering, it persists whatever the orchestrator decided.
    pub fn set_status(
        &self,
        evaluation_id: &str,
        status: EvaluationStatus,
        error_tag: Option<&str>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE evaluations SET status = ?1, error_tag = ?2 WHERE evaluation_id = ?3",
            params![status.as_str(), error_tag, evaluation_id],
        )?;
        Ok(())
    }

    pub fn complete_evaluation(
        &self,
        evaluation_id: &str,
        scores: &[EvaluationScore],
        total: u32,
        finished_at: DateTime<Utc>,
        strategy_id: Option<&str>,
    ) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE evaluations SET status = ?1, finished_at = ?2, total = ?3, strategy_id = ?4
             WHERE evaluation_id = ?5",
            params![
                EvaluationStatus::Completed.as_str(),
                finished_at.to_rfc3339(),
                total,
                strategy_id,
                evaluation_id
            ],
        )?;
        for (ord, score) in scores.iter().enumerate() {
            let files = serde_json::to_string(&score.source_files).unwrap();
            tx.execute(
                "INSERT INTO evaluation_scores (evaluation_id, criterion_name, score, max_score, feedback, source_files, ord)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![evaluation_id, score.criterion_name, score.score, score.max_score, score.feedback, files, ord as i64],
            )?;
        }
        tx.commit()
    }

    /// No-op if the evaluation is already terminal: a completed evaluation
    /// must never regress to failed, even if the caller observes an error
    /// after persisting completion (e.g. a ledger increment that fails
    /// after `complete_evaluation` has already committed).
    pub fn fail_evaluation(
        &self,
        evaluation_id: &str,
        error_tag: &str,
        finished_at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE evaluations SET status = ?1, error_tag = ?2, finished_at = ?3
             WHERE evaluation_id = ?4 AND status NOT IN ('completed', 'failed')",
            params![EvaluationStatus::Failed.as_str(), error_tag, finished_at.to_rfc3339(), evaluation_id],
        )?;
        Ok(())
    }

    pub fn get_evaluation(&self, evaluation_id: &str) -> rusqlite::Result<Option<Evaluation>> {
        let conn = self.conn.lock().unwrap();
        let eval = conn
            .query_row(
                "SELECT evaluation_id, user_id, commit_owner, commit_repo, commit_hash, course_id,
                        status, started_at, finished_at, error_tag, total
                 FROM evaluations WHERE evaluation_id = ?1",
                params![evaluation_id],
                row_to_evaluation_shell,
            )
            .optional()?;

        let Some(mut eval) = eval else { return Ok(None) };

        let mut stmt = conn.prepare(
            "SELECT criterion_name, score, max_score, feedback, source_files
             FROM evaluation_scores WHERE evaluation_id = ?1 ORDER BY ord ASC",
        )?;
        let rows = stmt.query_map(params![evaluation_id], |row| {
            let files_json: String = row.get(4)?;
            let source_files: Vec<String> = serde_json::from_str(&files_json).unwrap_or_default();
            Ok(EvaluationScore {
                criterion_name: row.get(0)?,
                score: row.get(1)?,
                max_score: row.get(2)?,
                feedback: row.get(3)?,
                source_files,
            })
        })?;
        for row in rows {
            eval.scores.push(row?);
        }
        Ok(Some(eval))
    }

    // -- usage window ----------------------------------------------------

    pub fn get_usage_window(&self, user_id: &str, month: &str) -> rusqlite::Result<Option<UsageWindow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, month, evaluations_count, subscription_tier, reset_at, version
             FROM user_usage WHERE user_id = ?1 AND month = ?2",
            params![user_id, month],
            row_to_usage_window,
        )
        .optional()
    }

    pub fn insert_usage_window(&self, window: &UsageWindow) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO user_usage (user_id, month, evaluations_count, subscription_tier, reset_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                window.user_id,
                window.month,
                window.evaluations_count,
                window.tier.as_str(),
                window.reset_at.to_rfc3339(),
                window.version,
            ],
        )?;
        Ok(())
    }

    /// Optimistic-lock increment: only succeeds if `expected_version`
    /// still matches the stored row. Returns whether the write applied.
    pub fn increment_usage_window(
        &self,
        user_id: &str,
        month: &str,
        expected_version: u64,
    ) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE user_usage SET evaluations_count = evaluations_count + 1, version = version + 1
             WHERE user_id = ?1 AND month = ?2 AND version = ?3",
            params![user_id, month, expected_version],
        )?;
        Ok(updated == 1)
    }

    /// Roll every window whose `reset_at` has passed forward to the new
    /// month with a zeroed count. Idempotent: a window already rolled has
    /// `reset_at` in the future and is skipped.
    pub fn reset_expired_windows(&self, now: DateTime<Utc>, new_month: &str, new_reset_at: DateTime<Utc>) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE user_usage SET month = ?1, evaluations_count = 0, reset_at = ?2, version = version + 1
             WHERE reset_at <= ?3",
            params![new_month, new_reset_at.to_rfc3339(), now.to_rfc3339()],
        )?;
        Ok(updated)
    }

    // -- repository signatures / cached strategies ------------------------

    pub fn upsert_signature(&self, id: &str, course_id: &str, sig: &RepoSignature) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let technologies = serde_json::to_string(&sig.technologies).unwrap();
        let directory_structure = serde_json::to_string(&sig.directory_structure).unwrap();
        let file_types = serde_json::to_string(&sig.file_types).unwrap();
        let size_category = size_category_str(sig.size_category);
        conn.execute(
            "INSERT INTO repository_signatures (id, course_id, pattern_hash, technologies, directory_structure, size_category, file_types, first_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO NOTHING",
            params![id, course_id, sig.pattern_hash, technologies, directory_structure, size_category, file_types, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_strategy(&self, id: &str) -> rusqlite::Result<Option<CachedStrategy>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(&strategy_select_sql(), params![id], row_to_strategy).optional()
    }

    /// All strategies scoped to a course — the candidate pool the cache
    /// scores for similarity. Cross-course matching is forbidden by
    /// construction: this query never leaves the course.
    pub fn strategies_for_course(&self, course_id: &str) -> rusqlite::Result<Vec<CachedStrategy>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{} WHERE cs.course_id = ?1", strategy_select_sql());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![course_id], row_to_strategy)?;
        rows.collect()
    }

    pub fn count_strategies(&self) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM cached_strategies", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
    }

    pub fn insert_strategy(&self, strategy: &CachedStrategy, signature_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let files = serde_json::to_string(&strategy.selected_files).unwrap();
        conn.execute(
            "INSERT INTO cached_strategies (id, signature_id, course_id, selected_files, perf_accuracy,
                perf_processing_time_ms, perf_evaluation_quality, usage_count, success_count, success_rate,
                source, created_at, last_used, last_updated, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                strategy.id,
                signature_id,
                strategy.course_id,
                files,
                strategy.performance.accuracy,
                strategy.performance.processing_time_ms,
                strategy.performance.evaluation_quality,
                strategy.performance.usage_count,
                0i64,
                strategy.performance.success_rate,
                strategy.source.as_str(),
                strategy.metadata.created_at.to_rfc3339(),
                strategy.metadata.last_used.to_rfc3339(),
                strategy.metadata.last_updated.to_rfc3339(),
                strategy.metadata.version,
            ],
        )?;
        Ok(())
    }

    /// Re-store of an already-cached strategy: update the file selection
    /// without touching `usage_count` (store idempotence, §8).
    pub fn update_strategy_files(&self, id: &str, files: &[String]) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let files_json = serde_json::to_string(files).unwrap();
        conn.execute(
            "UPDATE cached_strategies SET selected_files = ?1, last_updated = ?2, version = version + 1
             WHERE id = ?3",
            params![files_json, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Bump `usageCount` and stamp `lastUsed`, atomically, on a cache hit.
    pub fn touch_usage(&self, id: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE cached_strategies SET usage_count = usage_count + 1, last_used = ?1, version = version + 1
             WHERE id = ?2",
            params![now.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Blend `qualityScore` into `evaluationQuality` as a running mean over
    /// `usageCount`, and recompute `successRate = successes / usageCount`.
    pub fn record_outcome(&self, id: &str, success: bool, quality: Option<f64>) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let (usage_count, success_count, eval_quality): (i64, i64, f64) = conn.query_row(
            "SELECT usage_count, success_count, perf_evaluation_quality FROM cached_strategies WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let new_success_count = if success { success_count + 1 } else { success_count };
        let new_success_rate = if usage_count > 0 { new_success_count as f64 / usage_count as f64 } else { 0.0 };
        let new_quality = match quality {
            Some(q) if usage_count > 0 => {
                (eval_quality * (usage_count as f64 - 1.0) + q) / usage_count as f64
            }
            Some(q) => q,
            None => eval_quality,
        };

        conn.execute(
            "UPDATE cached_strategies SET success_count = ?1, success_rate = ?2, perf_evaluation_quality = ?3,
                last_updated = ?4, version = version + 1
             WHERE id = ?5",
            params![new_success_count, new_success_rate, new_quality, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Evict the strategy with the oldest `last_used`. Returns its id.
    pub fn evict_lru(&self) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let victim: Option<String> = conn
            .query_row(
                "SELECT id FROM cached_strategies ORDER BY last_used ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = &victim {
            conn.execute("DELETE FROM cached_strategies WHERE id = ?1", params![id])?;
        }
        Ok(victim)
    }

    pub fn cache_stats(&self) -> rusqlite::Result<(usize, u64, f64)> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(usage_count), 0), COALESCE(AVG(success_rate), 0.0) FROM cached_strategies",
            [],
            |row| {
                let size: i64 = row.get(0)?;
                let total_usage: i64 = row.get(1)?;
                let avg_success: f64 = row.get(2)?;
                Ok((size as usize, total_usage as u64, avg_success))
            },
        )
    }
}

fn size_category_str(c: SizeCategory) -> &'static str {
    match c {
        SizeCategory::Small => "small",
        SizeCategory::Medium => "medium",
        SizeCategory::Large => "large",
    }
}

fn parse_size_category(raw: &str) -> SizeCategory {
    match raw {
        "small" => SizeCategory::Small,
        "large" => SizeCategory::Large,
        _ => SizeCategory::Medium,
    }
}

fn row_to_evaluation_shell(row: &Row) -> rusqlite::Result<Evaluation> {
    let status: String = row.get(6)?;
    let started_at: String = row.get(7)?;
    let finished_at: Option<String> = row.get(8)?;
    Ok(Evaluation {
        evaluation_id: row.get(0)?,
        user_id: row.get(1)?,
        commit_ref: CommitRef { owner: row.get(2)?, repo: row.get(3)?, commit_hash: row.get(4)? },
        course_id: row.get(5)?,
        status: EvaluationStatus::parse(&status).unwrap_or(EvaluationStatus::Failed),
        scores: Vec::new(),
        total: row.get(10)?,
        started_at: DateTime::parse_from_rfc3339(&started_at).unwrap().with_timezone(&Utc),
        finished_at: finished_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
        error_tag: row.get(9)?,
    })
}

fn row_to_usage_window(row: &Row) -> rusqlite::Result<UsageWindow> {
    let tier: String = row.get(3)?;
    let reset_at: String = row.get(4)?;
    Ok(UsageWindow {
        user_id: row.get(0)?,
        month: row.get(1)?,
        evaluations_count: row.get(2)?,
        tier: Tier::parse(&tier).unwrap_or(Tier::Free),
        reset_at: DateTime::parse_from_rfc3339(&reset_at).unwrap().with_timezone(&Utc),
        version: row.get(5)?,
    })
}

fn strategy_select_sql() -> String {
    "SELECT cs.id, cs.course_id, cs.selected_files, cs.perf_accuracy, cs.perf_processing_time_ms,
            cs.perf_evaluation_quality, cs.usage_count, cs.success_rate, cs.created_at, cs.last_used,
            cs.last_updated, cs.version, rs.pattern_hash, rs.technologies, rs.directory_structure,
            rs.size_category, rs.file_types, cs.source
     FROM cached_strategies cs JOIN repository_signatures rs ON rs.id = cs.signature_id"
        .to_string()
}

fn row_to_strategy(row: &Row) -> rusqlite::Result<CachedStrategy> {
    let files_json: String = row.get(2)?;
    let selected_files: Vec<String> = serde_json::from_str(&files_json).unwrap_or_default();
    let created_at: String = row.get(8)?;
    let last_used: String = row.get(9)?;
    let last_updated: String = row.get(10)?;
    let pattern_hash: String = row.get(12)?;
    let technologies_json: String = row.get(13)?;
    let directory_structure_json: String = row.get(14)?;
    let size_category: String = row.get(15)?;
    let file_types_json: String = row.get(16)?;
    let source: String = row.get(17)?;

    let technologies: BTreeSet<String> = serde_json::from_str(&technologies_json).unwrap_or_default();
    let directory_structure: BTreeSet<String> =
        serde_json::from_str(&directory_structure_json).unwrap_or_default();
    let file_types = serde_json::from_str(&file_types_json).unwrap_or_default();

    Ok(CachedStrategy {
        id: row.get(0)?,
        course_id: row.get(1)?,
        selected_files,
        source: StrategySource::parse(&source),
        performance: StrategyPerformance {
            accuracy: row.get(3)?,
            processing_time_ms: row.get::<_, i64>(4)? as u64,
            evaluation_quality: row.get(5)?,
            usage_count: row.get::<_, i64>(6)? as u64,
            success_rate: row.get(7)?,
        },
        metadata: StrategyMetadata {
            created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
            last_used: DateTime::parse_from_rfc3339(&last_used).unwrap().with_timezone(&Utc),
            last_updated: DateTime::parse_from_rfc3339(&last_updated).unwrap().with_timezone(&Utc),
            version: row.get(11)?,
        },
        signature: RepoSignature {
            directory_structure,
            technologies,
            file_types,
            size_category: parse_size_category(&size_category),
            pattern_hash,
        },
    })
}
