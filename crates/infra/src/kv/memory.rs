use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KeyValueBackend, KvError, glob_match};

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    zsets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-process key-value backend (dev/tests).
///
/// Single-process and non-durable. Expiry is evaluated lazily on access.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    inner: RwLock<Inner>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, KvError> {
        self.inner
            .read()
            .map_err(|_| KvError::Command("in-memory kv lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, KvError> {
        self.inner
            .write()
            .map_err(|_| KvError::Command("in-memory kv lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        let inner = self.read()?;
        Ok(inner
            .strings
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut inner = self.write()?;
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut inner = self.write()?;
        if inner.strings.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let now = Instant::now();
        let inner = self.read()?;
        Ok(inner
            .strings
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut inner = self.write()?;
        let string = inner.strings.remove(key).is_some_and(|e| e.is_live(now));
        let zset = inner.zsets.remove(key).is_some();
        let hash = inner.hashes.remove(key).is_some();
        Ok(string || zset || hash)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut inner = self.write()?;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut inner = self.write()?;
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zrevrange(
        &self,
        key: &str,
        offset: usize,
        count: Option<usize>,
    ) -> Result<Vec<String>, KvError> {
        let inner = self.read()?;
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
        // Same tie-break as Redis: equal scores in reverse lexicographic order.
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(a.0)));

        Ok(members
            .into_iter()
            .skip(offset)
            .take(count.unwrap_or(usize::MAX))
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        let inner = self.read()?;
        Ok(inner.zsets.get(key).map_or(0, HashMap::len))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let inner = self.read()?;
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.write()?;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut inner = self.write()?;
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            inner.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        let inner = self.read()?;
        let strings = inner
            .strings
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k);
        let mut keys: Vec<String> = strings
            .chain(inner.zsets.keys())
            .chain(inner.hashes.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.read().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_writes_once() {
        let kv = InMemoryKv::new();
        let ttl = Duration::from_secs(30);

        assert!(kv.set_nx_ex("lock", "a", ttl).await.unwrap());
        assert!(!kv.set_nx_ex("lock", "b", ttl).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_values_disappear() {
        let kv = InMemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.ttl("k").await.unwrap(), None);
        assert!(kv.scan_keys("*").await.unwrap().is_empty());
        assert!(kv.set_nx_ex("k", "again", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_is_reset_by_set_ex() {
        let kv = InMemoryKv::new();
        kv.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();
        kv.set_ex("k", "v2", Duration::from_secs(500)).await.unwrap();

        let ttl = kv.ttl("k").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(400));
    }

    #[tokio::test]
    async fn zrevrange_is_score_descending_with_paging() {
        let kv = InMemoryKv::new();
        kv.zadd("idx", "a", 1.0).await.unwrap();
        kv.zadd("idx", "b", 3.0).await.unwrap();
        kv.zadd("idx", "c", 2.0).await.unwrap();

        assert_eq!(kv.zrevrange("idx", 0, None).await.unwrap(), vec!["b", "c", "a"]);
        assert_eq!(kv.zrevrange("idx", 1, Some(1)).await.unwrap(), vec!["c"]);
        assert_eq!(kv.zcard("idx").await.unwrap(), 3);

        assert!(kv.zrem("idx", "c").await.unwrap());
        assert!(!kv.zrem("idx", "c").await.unwrap());
        assert_eq!(kv.zcard("idx").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn hashes_and_scan() {
        let kv = InMemoryKv::new();
        kv.hset("h", "f", "1").await.unwrap();
        kv.set_ex("p:job:1", "x", Duration::from_secs(5)).await.unwrap();
        kv.zadd("p:jobs:status:queued", "1", 1.0).await.unwrap();

        assert_eq!(kv.hget("h", "f").await.unwrap().as_deref(), Some("1"));
        assert!(kv.hdel("h", "f").await.unwrap());
        assert_eq!(kv.hget("h", "f").await.unwrap(), None);

        assert_eq!(kv.scan_keys("p:job:*").await.unwrap(), vec!["p:job:1"]);
        assert_eq!(kv.scan_keys("p:*").await.unwrap().len(), 2);
    }
}
