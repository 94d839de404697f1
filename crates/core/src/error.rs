use thiserror::Error;

/// Errors raised by pure, I/O-free core logic: fingerprinting, guardrail
/// filtering, and course/criterion lookups.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("file listing has {0} entries, exceeding the configured cap of {1}")]
    InputTooLarge(usize, usize),

    #[error("path '{0}' is invalid (absolute, empty, or contains '..')")]
    InvalidPath(String),

    #[error("unknown course '{0}'")]
    UnknownCourse(String),

    #[error("course '{0}' has zero criteria")]
    EmptyCriteria(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
