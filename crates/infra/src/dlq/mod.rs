//! Dead-letter queue: terminally failed jobs kept for inspection and replay.

pub mod persistent;
pub mod store;
pub mod types;

pub use persistent::PersistentDeadLetterStore;
pub use store::{DeadLetterStore, DeadLetterStoreError, InMemoryDeadLetterStore, Pagination};
pub use types::{DeadLetterEntry, DeadLetterFilter, DeadLetterStats, FailureReason};
