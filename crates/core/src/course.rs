//! Course / criterion model and the criterion-name canonicalizer.
//!
//! A `Course` is loaded once at startup (from `courses.toml` on the server
//! side) and held for the process lifetime; this module only deals with the
//! in-memory shape and the pure lookups built on top of it.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single rubric dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub max_score: u32,
    #[serde(default)]
    pub evidence_hints: Vec<String>,
    /// Alternate labels a grading model might emit for this criterion,
    /// reconciled to `name` by `Course::canonical_name`. Configuration, not
    /// code — lives on the course record.
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// `(courseId, displayName, maxTotalScore, criteria[])`. Criteria order is
/// authoritative and preserved when rendering results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub course_id: String,
    pub display_name: String,
    pub max_total_score: u32,
    pub criteria: Vec<Criterion>,
}

impl Course {
    /// Reject courses with zero criteria at load time rather than letting
    /// them fail downstream.
    pub fn validate(&self) -> Result<()> {
        if self.criteria.is_empty() {
            return Err(CoreError::EmptyCriteria(self.course_id.clone()));
        }
        Ok(())
    }

    /// Resolve a model-produced label to this course's canonical criterion
    /// name, matching case-insensitively against both `name` and `aliases`.
    /// Falls back to the raw label (title-cased trim) if nothing matches, so
    /// callers always get a renderable string.
    pub fn canonical_name(&self, raw: &str) -> String {
        let needle = raw.trim().to_lowercase();
        for criterion in &self.criteria {
            if criterion.name.to_lowercase() == needle {
                return criterion.name.clone();
            }
            if criterion.aliases.iter().any(|a| a.to_lowercase() == needle) {
                return criterion.name.clone();
            }
        }
        raw.trim().to_string()
    }

    pub fn criterion(&self, name: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.name == name)
    }
}

/// In-memory registry of every known course, keyed by `courseId`. Built once
/// at startup and treated as read-only for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct CourseCatalog {
    courses: HashMap<String, Course>,
}

impl CourseCatalog {
    /// Build a catalog from a list of courses, validating each. The whole
    /// catalog fails to build if any course is malformed — a bad course
    /// record should not silently disappear.
    pub fn new(courses: Vec<Course>) -> Result<Self> {
        let mut map = HashMap::with_capacity(courses.len());
        for course in courses {
            course.validate()?;
            map.insert(course.course_id.clone(), course);
        }
        Ok(Self { courses: map })
    }

    /// Unknown `courseId` is a caller error, not a runtime failure.
    pub fn get(&self, course_id: &str) -> Result<&Course> {
        self.courses.get(course_id).ok_or_else(|| CoreError::UnknownCourse(course_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_course() -> Course {
        Course {
            course_id: "mlops".to_string(),
            display_name: "MLOps Fundamentals".to_string(),
            max_total_score: 20,
            criteria: vec![
                Criterion {
                    name: "Transformations (dbt, spark, etc)".to_string(),
                    max_score: 10,
                    evidence_hints: vec!["dbt/".to_string(), "*.sql".to_string()],
                    aliases: vec!["Transformations".to_string()],
                },
                Criterion {
                    name: "Orchestration".to_string(),
                    max_score: 10,
                    evidence_hints: vec!["src/pipeline/".to_string()],
                    aliases: vec![],
                },
            ],
        }
    }

    #[test]
    fn canonical_name_resolves_alias_case_insensitively() {
        let course = sample_course();
        assert_eq!(course.canonical_name("transformations"), "Transformations (dbt, spark, etc)");
        assert_eq!(course.canonical_name("ORCHESTRATION"), "Orchestration");
        assert_eq!(course.canonical_name("Something Unknown"), "Something Unknown");
    }

    #[test]
    fn catalog_rejects_empty_criteria() {
        let mut course = sample_course();
        course.criteria.clear();
        let err = CourseCatalog::new(vec![course]).unwrap_err();
        assert!(matches!(err, CoreError::EmptyCriteria(_)));
    }

    #[test]
    fn catalog_lookup_unknown_course_is_caller_error() {
        let catalog = CourseCatalog::new(vec![sample_course()]).unwrap();
        let err = catalog.get("nonexistent").unwrap_err();
        assert!(matches!(err, CoreError::UnknownCourse(_)));
    }
}
