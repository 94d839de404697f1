//! Startup configuration, loaded once from the environment per §6.

use std::path::PathBuf;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub github_api_base: String,
    pub model_api_base: String,
    pub model_api_key: String,
    pub cache_similarity_threshold: f64,
    pub max_cache_entries: usize,
    pub max_files_per_evaluation: usize,
    pub max_file_bytes: u64,
    pub max_aggregate_bytes: u64,
    pub eval_deadline: Duration,
    pub courses_path: PathBuf,
    pub database_path: PathBuf,
    pub bind_addr: String,
    pub port: u16,
}

impl Config {
    /// Load from the environment, with defaults for every optional cap. CLI
    /// flags take precedence and are applied by the caller after this
    /// returns; this only resolves env vars and hardcoded defaults.
    pub fn from_env() -> Self {
        Self {
            github_api_base: std::env::var("GITHUB_API_BASE")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            model_api_base: std::env::var("MODEL_API_BASE")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string()),
            model_api_key: std::env::var("MODEL_API_KEY").unwrap_or_default(),
            cache_similarity_threshold: env_or("CACHE_SIMILARITY_THRESHOLD", 0.8),
            max_cache_entries: env_or("MAX_CACHE_ENTRIES", 10_000usize),
            max_files_per_evaluation: env_or("MAX_FILES_PER_EVALUATION", 50usize),
            max_file_bytes: env_or("MAX_FILE_BYTES", 512 * 1024u64),
            max_aggregate_bytes: env_or("MAX_AGGREGATE_BYTES", 4 * 1024 * 1024u64),
            eval_deadline: Duration::from_secs(env_or("EVAL_DEADLINE_SECONDS", 300u64)),
            courses_path: std::env::var("COURSES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("courses.toml")),
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rubricforge.sqlite3")),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("PORT", 8432u16),
        }
    }
}
