//! Repository fingerprinting: guardrail filtering, technology inference, and
//! the `RepoSignature` derived entity used as the cache key.

use crate::error::{CoreError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Default cap on the number of entries a file listing may contain before
/// `compute_signature` refuses to process it.
pub const DEFAULT_MAX_FILES: usize = 20_000;

/// Directory prefixes used for the `patternHash` skeleton.
const SKELETON_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// Guardrail filter
// ---------------------------------------------------------------------------

const EXCLUDED_EXTENSIONS: &[&str] = &[
    // image
    "png", "jpg", "jpeg", "gif", "bmp", "webp", "svg", "ico", "tiff",
    // audio / video
    "mp3", "wav", "flac", "ogg", "mp4", "mov", "avi", "mkv", "webm",
    // archive
    "zip", "tar", "gz", "bz2", "xz", "7z", "rar",
    // office
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "pdf",
    // tabular
    "csv", "tsv",
];

/// JSON basenames that survive the guardrail filter despite the blanket rule
/// against data-interchange noise files.
const JSON_ALLOW_BASENAMES: &[&str] =
    &["package.json", "tsconfig.json", "components.json", "dashboard.json"];

/// Lowercase a path's extension and collapse duplicate slashes; reject
/// traversal attempts and absolute paths.
pub fn normalize_path(raw: &str) -> Result<String> {
    if raw.is_empty() || raw.starts_with('/') || raw.split('/').any(|seg| seg == "..") {
        return Err(CoreError::InvalidPath(raw.to_string()));
    }

    let mut collapsed = String::with_capacity(raw.len());
    let mut prev_slash = false;
    for c in raw.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        collapsed.push(c);
    }

    let (stem, ext) = match collapsed.rsplit_once('/') {
        Some((dir, file)) => (format!("{dir}/"), file),
        None => (String::new(), collapsed.as_str()),
    };

    let lowered = match file_extension(ext) {
        Some(e) => {
            let lower_ext = e.to_lowercase();
            let base = &ext[..ext.len() - e.len() - 1];
            format!("{base}.{lower_ext}")
        }
        None => ext.to_string(),
    };

    Ok(format!("{stem}{lowered}"))
}

fn file_extension(filename: &str) -> Option<&str> {
    filename.rsplit_once('.').map(|(_, ext)| ext).filter(|e| !e.is_empty())
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn extension_of(path: &str) -> String {
    file_extension(basename(path)).unwrap_or("").to_lowercase()
}

/// Whether `path` survives the guardrail filter: blocked media and archive
/// extensions, any path under a `logs/` segment, and JSON files
/// whose basename isn't on the small allow-set.
pub fn passes_guardrail(path: &str) -> bool {
    if path.split('/').any(|seg| seg == "logs") {
        return false;
    }

    let ext = extension_of(path);
    if EXCLUDED_EXTENSIONS.contains(&ext.as_str()) {
        return false;
    }

    if ext == "json" {
        let base = basename(path).to_lowercase();
        return JSON_ALLOW_BASENAMES.contains(&base.as_str());
    }

    true
}

/// Apply the guardrail filter to a full listing, normalizing each surviving
/// path. Invalid paths are dropped rather than propagated — callers that
/// need strict validation should normalize up front.
pub fn filter_guardrail(paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| normalize_path(p).ok())
        .filter(|p| passes_guardrail(p))
        .collect()
}

// ---------------------------------------------------------------------------
// Technology vocabulary
// ---------------------------------------------------------------------------

fn infer_technologies(paths: &[String]) -> BTreeSet<String> {
    let mut techs = BTreeSet::new();
    for path in paths {
        let base = basename(path).to_lowercase();
        let ext = extension_of(path);

        match ext.as_str() {
            "py" => techs.insert("python".to_string()),
            "sql" => techs.insert("sql".to_string()),
            "tf" | "tfvars" => techs.insert("terraform".to_string()),
            "yaml" | "yml" => techs.insert("yaml".to_string()),
            "rs" => techs.insert("rust".to_string()),
            "go" => techs.insert("go".to_string()),
            "ts" | "tsx" => techs.insert("typescript".to_string()),
            "js" | "jsx" => techs.insert("javascript".to_string()),
            "java" => techs.insert("java".to_string()),
            "ipynb" => techs.insert("notebook".to_string()),
            _ => false,
        };

        match base.as_str() {
            "dockerfile" => techs.insert("docker".to_string()),
            "docker-compose.yml" | "docker-compose.yaml" => techs.insert("docker".to_string()),
            "dbt_project.yml" => techs.insert("dbt".to_string()),
            "requirements.txt" | "pyproject.toml" | "pipfile" => techs.insert("python".to_string()),
            "package.json" => techs.insert("javascript".to_string()),
            "cargo.toml" => techs.insert("rust".to_string()),
            "go.mod" => techs.insert("go".to_string()),
            _ => false,
        };

        if path.contains("/dbt/") || path.starts_with("dbt/") {
            techs.insert("dbt".to_string());
        }
        if path.contains("/terraform/") || path.starts_with("terraform/") {
            techs.insert("terraform".to_string());
        }
    }
    techs
}

// ---------------------------------------------------------------------------
// Directory structure
// ---------------------------------------------------------------------------

/// Every proper prefix directory of every path, deduplicated and sorted.
fn directory_structure(paths: &[String]) -> BTreeSet<String> {
    let mut dirs = BTreeSet::new();
    for path in paths {
        let parts: Vec<&str> = path.split('/').collect();
        for depth in 1..parts.len() {
            dirs.insert(parts[..depth].join("/"));
        }
    }
    dirs
}

/// The directory set filtered to depth <= `SKELETON_DEPTH`, used only for
/// the `patternHash` digest.
fn skeleton(dirs: &BTreeSet<String>) -> BTreeSet<String> {
    dirs.iter().filter(|d| d.matches('/').count() + 1 <= SKELETON_DEPTH).cloned().collect()
}

// ---------------------------------------------------------------------------
// Size category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    pub fn from_count(count: usize) -> Self {
        if count < 10 {
            SizeCategory::Small
        } else if count < 25 {
            SizeCategory::Medium
        } else {
            SizeCategory::Large
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern hash
// ---------------------------------------------------------------------------

/// 64-bit non-cryptographic digest (xxh3, seed 0), hex-encoded and truncated
/// to 16 characters. Stable across platforms and processes by construction —
/// `xxh3_64_with_seed` has no platform-dependent state.
fn pattern_hash(course_id: &str, key_basenames: &[String], skeleton: &BTreeSet<String>) -> String {
    let mut sorted_basenames = key_basenames.to_vec();
    sorted_basenames.sort();

    let mut buf = String::new();
    buf.push_str(course_id);
    buf.push('\0');
    buf.push_str(&sorted_basenames.join(","));
    buf.push('\0');
    buf.push_str(&skeleton.iter().cloned().collect::<Vec<_>>().join(","));

    let digest = xxhash_rust::xxh3::xxh3_64_with_seed(buf.as_bytes(), 0);
    format!("{digest:016x}")
}

// ---------------------------------------------------------------------------
// RepoSignature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepoSignature {
    pub directory_structure: BTreeSet<String>,
    pub technologies: BTreeSet<String>,
    pub file_types: BTreeMap<String, usize>,
    pub size_category: SizeCategory,
    pub pattern_hash: String,
}

/// Compute a `RepoSignature` from an already-guardrail-filtered listing and
/// the basenames of small key files (README, manifests) read for technology
/// inference. Pure and deterministic: identical input yields identical
/// output, independent of listing order.
pub fn compute_signature(
    course_id: &str,
    filtered_paths: &[String],
    key_basenames: &[String],
    max_files: usize,
) -> Result<RepoSignature> {
    if filtered_paths.len() > max_files {
        return Err(CoreError::InputTooLarge(filtered_paths.len(), max_files));
    }

    let directory_structure = directory_structure(filtered_paths);
    let technologies = infer_technologies(filtered_paths);

    let mut file_types: BTreeMap<String, usize> = BTreeMap::new();
    for path in filtered_paths {
        let ext = extension_of(path);
        if !ext.is_empty() {
            *file_types.entry(ext).or_insert(0) += 1;
        }
    }

    let size_category = SizeCategory::from_count(filtered_paths.len());
    let skel = skeleton(&directory_structure);
    let pattern_hash = pattern_hash(course_id, key_basenames, &skel);

    Ok(RepoSignature { directory_structure, technologies, file_types, size_category, pattern_hash })
}

/// Deterministic id for a `(signature, courseId, namespace)` triple, used
/// as the cache's upsert key so concurrent lookup+store never creates
/// duplicate rows. Unlike `pattern_hash` alone, this covers the full
/// signature — two strategies sharing a `patternHash` but differing
/// technologies or directory structure get distinct ids and can coexist
/// in the cache. `namespace` keeps disjoint provenances (e.g. a real
/// tenant evaluation versus a synthetically warmed shape) from ever
/// colliding even when every other field matches.
pub fn signature_id(signature: &RepoSignature, course_id: &str, namespace: &str) -> String {
    let mut buf = String::new();
    buf.push_str(namespace);
    buf.push('\0');
    buf.push_str(course_id);
    buf.push('\0');
    buf.push_str(&signature.pattern_hash);
    buf.push('\0');
    buf.push_str(&signature.technologies.iter().cloned().collect::<Vec<_>>().join(","));
    buf.push('\0');
    buf.push_str(&signature.directory_structure.iter().cloned().collect::<Vec<_>>().join(","));
    buf.push('\0');
    buf.push_str(match signature.size_category {
        SizeCategory::Small => "small",
        SizeCategory::Medium => "medium",
        SizeCategory::Large => "large",
    });

    let digest = xxhash_rust::xxh3::xxh3_64_with_seed(buf.as_bytes(), 0);
    format!("{digest:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guardrail_drops_media_and_under_logs() {
        let paths = vec![
            "README.md".to_string(),
            "docs/plan.pdf".to_string(),
            "logs/run.txt".to_string(),
            "a/logs/b.py".to_string(),
            "package.json".to_string(),
            "random.json".to_string(),
        ];
        let kept = filter_guardrail(&paths);
        assert!(kept.contains(&"README.md".to_string()));
        assert!(kept.contains(&"package.json".to_string()));
        assert!(!kept.iter().any(|p| p.ends_with(".pdf")));
        assert!(!kept.iter().any(|p| p.contains("logs/")));
        assert!(!kept.contains(&"random.json".to_string()));
    }

    #[test]
    fn signature_is_permutation_invariant() {
        let a = vec!["src/a.py".to_string(), "src/b.py".to_string(), "README.md".to_string()];
        let b = vec!["README.md".to_string(), "src/b.py".to_string(), "src/a.py".to_string()];
        let keys = vec!["README.md".to_string()];
        let sig_a = compute_signature("mlops", &a, &keys, DEFAULT_MAX_FILES).unwrap();
        let sig_b = compute_signature("mlops", &b, &keys, DEFAULT_MAX_FILES).unwrap();
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn input_too_large_is_rejected() {
        let paths: Vec<String> = (0..5).map(|i| format!("f{i}.py")).collect();
        let err = compute_signature("mlops", &paths, &[], 3).unwrap_err();
        assert!(matches!(err, CoreError::InputTooLarge(5, 3)));
    }

    #[test]
    fn size_category_boundaries() {
        assert_eq!(SizeCategory::from_count(9), SizeCategory::Small);
        assert_eq!(SizeCategory::from_count(10), SizeCategory::Medium);
        assert_eq!(SizeCategory::from_count(24), SizeCategory::Medium);
        assert_eq!(SizeCategory::from_count(25), SizeCategory::Large);
    }
}
