//! `blueprintx-core` — shared building blocks for the job engine.
//!
//! This crate contains **pure** primitives (no storage or runtime concerns):
//! identifiers, the closed set of job types and the domain error model.

pub mod error;
pub mod id;
pub mod job_type;

pub use error::DomainError;
pub use id::{DlqId, JobId};
pub use job_type::JobType;

/// Opaque key/value payload exchanged with pipeline handlers.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
