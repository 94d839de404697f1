//! RubricForge server library: HTTP surface, persistence, and the
//! orchestrator wiring everything else together. `main.rs` is a thin CLI
//! shell over this crate.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod model_client;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;
pub mod types;
pub mod warmer;

use rubricforge_core::{Course, CourseCatalog};
use std::path::Path;

#[derive(serde::Deserialize)]
struct CoursesFile {
    #[serde(default)]
    course: Vec<Course>,
}

/// Parse `courses.toml` into a catalog. Course definitions are
/// configuration, not code — this is the only place they're loaded from
/// disk.
pub fn load_course_catalog(path: &Path) -> anyhow::Result<CourseCatalog> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read courses file {}: {e}", path.display()))?;
    let parsed: CoursesFile = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse courses file {}: {e}", path.display()))?;
    Ok(CourseCatalog::new(parsed.course)?)
}
