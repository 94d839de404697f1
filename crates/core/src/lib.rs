//! Pure, I/O-free core logic for RubricForge: repository fingerprinting,
//! similarity scoring, the course/criterion model, and the shared selection
//! result types. Everything here is synchronous and unit-testable without a
//! runtime; the `server` crate is the only place that talks to the network
//! or a database.

pub mod course;
pub mod error;
pub mod pipeline_types;
pub mod signature;
pub mod similarity;

pub use course::{Course, CourseCatalog, Criterion};
pub use error::{CoreError, Result};
pub use pipeline_types::{SelectionMethod, SelectionResult};
pub use signature::{
    compute_signature, filter_guardrail, passes_guardrail, signature_id, RepoSignature, SizeCategory,
};
pub use similarity::{confidence, similarity};
