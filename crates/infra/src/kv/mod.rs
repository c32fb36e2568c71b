//! Key-value backend used by the persistent job and dead-letter stores.
//!
//! The stores only need a small command surface: string records with expiry,
//! sorted sets for ordered secondary indices, hashes for point lookups and a
//! pattern scan for maintenance sweeps. Any backend offering those primitives
//! (Redis, or the in-process map used in dev/tests) can back the stores.

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::InMemoryKv;
#[cfg(feature = "redis")]
pub use redis_backend::RedisKv;

/// Namespace prepended to every key written by the stores.
pub const DEFAULT_KEY_PREFIX: &str = "blueprintx:";

/// Backend failure. Store-layer faults are never retried or dead-lettered; they
/// propagate to whoever called the store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    #[error("kv connection error: {0}")]
    Connection(String),

    #[error("kv command error: {0}")]
    Command(String),
}

/// Command surface required from a key-value backend.
///
/// Sorted-set reads are newest-first (`zrevrange`), matching how every index in
/// the stores is consumed.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set `key` with an expiry, replacing any previous value and TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Set `key` only if it does not exist. Returns whether the value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Remaining time to live. `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    async fn del(&self, key: &str) -> Result<bool, KvError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// Members ordered by descending score, skipping `offset`, at most `count`
    /// (`None` = to the end).
    async fn zrevrange(
        &self,
        key: &str,
        offset: usize,
        count: Option<usize>,
    ) -> Result<Vec<String>, KvError>;

    async fn zcard(&self, key: &str) -> Result<usize, KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;

    /// All keys matching a glob pattern (`*` and `?` wildcards).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();

    let (mut pi, mut ci) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ci < c.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            pi += 1;
            resume = ci;
        } else if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ci = resume;
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|ch| *ch == '*')
}

/// Score used for time-ordered sorted-set indices.
pub(crate) fn timestamp_score(at: chrono::DateTime<chrono::Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}
