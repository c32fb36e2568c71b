//! Job execution infrastructure: stores, runner, dead-letter queue, wiring.
//!
//! Everything here is backend-agnostic behind the [`kv::KeyValueBackend`]
//! seam; the Redis implementation is behind the `redis` feature.

pub mod config;
pub mod dlq;
pub mod jobs;
pub mod kv;
pub mod operations;
pub mod services;


pub use config::{ConfigError, JobSettings, StoreKind};
pub use operations::{JobOperations, OperationError};
pub use services::{JobServices, ServicesError};
