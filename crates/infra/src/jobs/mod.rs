//! Asynchronous job execution with retry, backoff, and dead-lettering.
//!
//! ## Design
//!
//! - A job is claimed (`queued → running`) atomically, so concurrent runners
//!   never execute the same attempt twice
//! - Failures are classified; transient ones are retried with exponential backoff
//! - Permanent failures and exhausted retries land in the dead-letter queue
//!
//! ## Components
//!
//! - `Job`: the persisted unit of work
//! - `JobStore`: persistence (in-memory or key-value backed)
//! - `JobRunner`: runs one attempt and decides retry vs dead-letter
//! - `RetryPoller`: background sweep for due retries

pub mod classify;
pub mod persistent;
pub mod poller;
pub mod runner;
pub mod store;
pub mod types;

pub use classify::{classify_error, classify_pipeline_error, is_retryable, truncate_error};
pub use persistent::PersistentJobStore;
pub use poller::{RetryPoller, RetryPollerHandle, RetryPollerStats};
pub use runner::{JobEvent, JobRunner, RunnerError};
pub use store::{ClaimOutcome, InMemoryJobStore, JobStore, JobStoreError, Transition};
pub use types::{Job, JobPatch, JobStats, JobStatus, NewJob, RetryPolicy, DEFAULT_MAX_RETRIES};
