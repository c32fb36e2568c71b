//! `blueprintx-pipelines`
//!
//! **Responsibility:** the seam between the job engine and the document pipelines.
//!
//! The pipelines themselves (ingest, plan summary, trade scopes, tender docs,
//! Q&A) live elsewhere. This crate only defines:
//! - the `Pipeline` trait a handler implements,
//! - the `PipelineError` every failure is expressed as (no panics, no soft failures),
//! - the `JobContext` handed to a handler (correlation metadata + progress sink),
//! - the `PipelineRegistry` that routes a `JobType` to exactly one handler.

pub mod context;
pub mod pipeline;
pub mod registry;
pub mod result;

pub use context::{JobContext, NoopProgress, ProgressSink};
pub use pipeline::{FnPipeline, Pipeline, pipeline_fn};
pub use registry::PipelineRegistry;
pub use result::{PipelineError, PipelineResult};
