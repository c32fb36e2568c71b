//! Dead-letter store over a key-value backend.
//!
//! ## Layout
//!
//! - `{prefix}dlq:{dlq_id}`: JSON record, expires after the entry TTL
//! - `{prefix}dlq_index:by_job_id`: hash original job id → latest dlq id
//! - `{prefix}dlq_index:unprocessed`: sorted set scored by `dlq_created_at`
//! - `{prefix}dlq_index:type:{job_type}`: sorted set scored by `dlq_created_at`
//! - `{prefix}dlq_index:project:{project_id}`: sorted set scored by `dlq_created_at`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument};

use blueprintx_core::{DlqId, JobId, JobType};

use super::store::{
    DeadLetterStore, DeadLetterStoreError, Pagination, purge_matches, sort_newest_first,
};
use super::types::{DeadLetterEntry, DeadLetterFilter, DeadLetterStats};
use crate::kv::{DEFAULT_KEY_PREFIX, KeyValueBackend, timestamp_score};

pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const INDEX_PAGE: usize = 200;

#[derive(Debug, Clone)]
struct DlqKeys {
    prefix: String,
}

impl DlqKeys {
    fn entry_prefix(&self) -> String {
        format!("{}dlq:", self.prefix)
    }

    fn entry(&self, dlq_id: DlqId) -> String {
        format!("{}{}", self.entry_prefix(), dlq_id)
    }

    fn entry_pattern(&self) -> String {
        format!("{}*", self.entry_prefix())
    }

    fn by_job_id(&self) -> String {
        format!("{}dlq_index:by_job_id", self.prefix)
    }

    fn unprocessed(&self) -> String {
        format!("{}dlq_index:unprocessed", self.prefix)
    }

    fn job_type(&self, job_type: JobType) -> String {
        format!("{}dlq_index:type:{}", self.prefix, job_type.as_str())
    }

    fn project(&self, project_id: &str) -> String {
        format!("{}dlq_index:project:{}", self.prefix, project_id)
    }
}

/// Durable dead-letter store backed by any [`KeyValueBackend`].
#[derive(Clone)]
pub struct PersistentDeadLetterStore {
    kv: Arc<dyn KeyValueBackend>,
    keys: DlqKeys,
    entry_ttl: Duration,
}

impl core::fmt::Debug for PersistentDeadLetterStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PersistentDeadLetterStore")
            .field("prefix", &self.keys.prefix)
            .field("entry_ttl", &self.entry_ttl)
            .finish_non_exhaustive()
    }
}

impl PersistentDeadLetterStore {
    pub fn new(kv: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            kv,
            keys: DlqKeys {
                prefix: DEFAULT_KEY_PREFIX.to_string(),
            },
            entry_ttl: DEFAULT_ENTRY_TTL,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    async fn load(&self, dlq_id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        match self.kv.get(&self.keys.entry(dlq_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        let prefix = self.keys.entry_prefix();
        let mut entries = Vec::new();
        for key in self.kv.scan_keys(&self.keys.entry_pattern()).await? {
            let Some(dlq_id) = key
                .strip_prefix(prefix.as_str())
                .and_then(|id| id.parse::<DlqId>().ok())
            else {
                continue;
            };
            if let Some(entry) = self.load(dlq_id).await? {
                entries.push(entry);
            }
        }
        sort_newest_first(&mut entries);
        Ok(entries)
    }

    /// Most selective index for a filter, or `None` when a full scan is needed.
    fn index_for(&self, filter: &DeadLetterFilter) -> Option<String> {
        if filter.processed == Some(false) {
            Some(self.keys.unprocessed())
        } else if let Some(job_type) = filter.job_type {
            Some(self.keys.job_type(job_type))
        } else {
            filter.project_id.as_deref().map(|p| self.keys.project(p))
        }
    }

    /// Walk an index newest-first, skipping `skip` matches and collecting up to
    /// `take` (`None` = all). Missing records are pruned from the index.
    async fn walk_index(
        &self,
        index_key: &str,
        filter: &DeadLetterFilter,
        skip: usize,
        take: Option<usize>,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        let mut out = Vec::new();
        let mut stale = Vec::new();
        let mut skipped = 0;
        let mut offset = 0;
        let take = take.unwrap_or(usize::MAX);

        'pages: while out.len() < take {
            let members = self.kv.zrevrange(index_key, offset, Some(INDEX_PAGE)).await?;
            if members.is_empty() {
                break;
            }
            offset += members.len();

            for member in members {
                let entry = match member.parse::<DlqId>() {
                    Ok(dlq_id) => self.load(dlq_id).await?,
                    Err(_) => None,
                };
                let Some(entry) = entry else {
                    stale.push(member);
                    continue;
                };
                if !filter.matches(&entry) {
                    continue;
                }
                if skipped < skip {
                    skipped += 1;
                    continue;
                }
                out.push(entry);
                if out.len() >= take {
                    break 'pages;
                }
            }
        }

        for member in &stale {
            self.kv.zrem(index_key, member).await?;
        }
        if !stale.is_empty() {
            debug!(index = index_key, pruned = stale.len(), "pruned stale dlq index members");
        }
        Ok(out)
    }

    async fn query(
        &self,
        filter: &DeadLetterFilter,
        skip: usize,
        take: Option<usize>,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        match self.index_for(filter) {
            Some(index_key) => self.walk_index(&index_key, filter, skip, take).await,
            None => Ok(self
                .load_all()
                .await?
                .into_iter()
                .filter(|e| filter.matches(e))
                .skip(skip)
                .take(take.unwrap_or(usize::MAX))
                .collect()),
        }
    }

    async fn remove(&self, entry: &DeadLetterEntry) -> Result<bool, DeadLetterStoreError> {
        let member = entry.dlq_id.to_string();
        let deleted = self.kv.del(&self.keys.entry(entry.dlq_id)).await?;

        let by_job_id = self.keys.by_job_id();
        let job_field = entry.original_job_id.to_string();
        if self.kv.hget(&by_job_id, &job_field).await?.as_deref() == Some(member.as_str()) {
            self.kv.hdel(&by_job_id, &job_field).await?;
        }
        self.kv.zrem(&self.keys.unprocessed(), &member).await?;
        self.kv.zrem(&self.keys.job_type(entry.job_type), &member).await?;
        if let Some(project_id) = &entry.project_id {
            self.kv.zrem(&self.keys.project(project_id), &member).await?;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl DeadLetterStore for PersistentDeadLetterStore {
    #[instrument(skip(self, entry), fields(dlq_id = %entry.dlq_id), err)]
    async fn add(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry, DeadLetterStoreError> {
        let json = serde_json::to_string(&entry)?;
        self.kv
            .set_ex(&self.keys.entry(entry.dlq_id), &json, self.entry_ttl)
            .await?;

        // Indices after the record; a crash in between only leaves the entry
        // unreachable through some index, never an index pointing at garbage.
        let member = entry.dlq_id.to_string();
        let score = timestamp_score(entry.dlq_created_at);
        self.kv
            .hset(&self.keys.by_job_id(), &entry.original_job_id.to_string(), &member)
            .await?;
        if !entry.processed {
            self.kv.zadd(&self.keys.unprocessed(), &member, score).await?;
        }
        self.kv
            .zadd(&self.keys.job_type(entry.job_type), &member, score)
            .await?;
        if let Some(project_id) = &entry.project_id {
            self.kv
                .zadd(&self.keys.project(project_id), &member, score)
                .await?;
        }

        info!(
            dlq_id = %entry.dlq_id,
            job_id = %entry.original_job_id,
            job_type = %entry.job_type,
            failure_reason = %entry.failure_reason,
            "dead-letter entry added"
        );
        Ok(entry)
    }

    async fn get(&self, dlq_id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        self.load(dlq_id).await
    }

    async fn get_by_job_id(
        &self,
        job_id: JobId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let Some(member) = self
            .kv
            .hget(&self.keys.by_job_id(), &job_id.to_string())
            .await?
        else {
            return Ok(None);
        };
        match member.parse::<DlqId>() {
            Ok(dlq_id) => self.load(dlq_id).await,
            Err(_) => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        if page.limit == 0 {
            return Ok(Vec::new());
        }
        self.query(filter, page.offset, Some(page.limit)).await
    }

    async fn count(&self, filter: &DeadLetterFilter) -> Result<usize, DeadLetterStoreError> {
        Ok(self.query(filter, 0, None).await?.len())
    }

    #[instrument(skip(self), err)]
    async fn mark_processed(
        &self,
        dlq_id: DlqId,
        requeued_job_id: Option<JobId>,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let Some(mut entry) = self.load(dlq_id).await? else {
            return Ok(None);
        };
        entry.mark_processed(requeued_job_id, Utc::now());

        // Keep the remaining lifetime; processing is not a reason to retain longer.
        let key = self.keys.entry(dlq_id);
        let ttl = self
            .kv
            .ttl(&key)
            .await?
            .filter(|t| !t.is_zero())
            .unwrap_or(self.entry_ttl);
        self.kv.set_ex(&key, &serde_json::to_string(&entry)?, ttl).await?;
        self.kv
            .zrem(&self.keys.unprocessed(), &dlq_id.to_string())
            .await?;

        info!(dlq_id = %dlq_id, requeued_job_id = ?requeued_job_id, "dead-letter entry processed");
        Ok(Some(entry))
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, dlq_id: DlqId) -> Result<bool, DeadLetterStoreError> {
        let Some(entry) = self.load(dlq_id).await? else {
            return Ok(false);
        };
        let deleted = self.remove(&entry).await?;
        if deleted {
            info!(dlq_id = %dlq_id, "dead-letter entry deleted");
        }
        Ok(deleted)
    }

    #[instrument(skip(self), err)]
    async fn purge(
        &self,
        processed_only: bool,
        older_than: Option<chrono::Duration>,
    ) -> Result<usize, DeadLetterStoreError> {
        let cutoff = older_than.map(|d| Utc::now() - d);
        let mut deleted = 0;
        for entry in self.load_all().await? {
            if purge_matches(&entry, processed_only, cutoff) && self.remove(&entry).await? {
                deleted += 1;
            }
        }
        info!(deleted, processed_only, "dead-letter queue purged");
        Ok(deleted)
    }

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterStoreError> {
        Ok(DeadLetterStats::from_entries(&self.load_all().await?))
    }

    async fn ping(&self) -> Result<(), DeadLetterStoreError> {
        Ok(self.kv.ping().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::FailureReason;
    use crate::jobs::NewJob;
    use crate::kv::InMemoryKv;
    use blueprintx_core::JsonMap;

    fn store() -> (Arc<InMemoryKv>, PersistentDeadLetterStore) {
        let kv = Arc::new(InMemoryKv::new());
        let store = PersistentDeadLetterStore::new(kv.clone()).with_key_prefix("t:");
        (kv, store)
    }

    fn entry(job_type: JobType, project: Option<&str>) -> DeadLetterEntry {
        let mut new_job = NewJob::new(job_type, JsonMap::new());
        if let Some(p) = project {
            new_job = new_job.with_project(p);
        }
        let job = new_job.into_job(Utc::now());
        DeadLetterEntry::from_job(
            &job,
            FailureReason::ExternalServiceError,
            "ServiceUnavailable: 503",
            Some("full trace".to_string()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn add_writes_all_indices() {
        let (kv, store) = store();
        let e = store.add(entry(JobType::Qna, Some("p1"))).await.unwrap();
        let member = e.dlq_id.to_string();

        assert_eq!(
            kv.hget("t:dlq_index:by_job_id", &e.original_job_id.to_string())
                .await
                .unwrap(),
            Some(member.clone())
        );
        assert_eq!(kv.zcard("t:dlq_index:unprocessed").await.unwrap(), 1);
        assert_eq!(kv.zcard("t:dlq_index:type:qna").await.unwrap(), 1);
        assert_eq!(kv.zcard("t:dlq_index:project:p1").await.unwrap(), 1);
        assert_eq!(store.get(e.dlq_id).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn job_id_index_points_at_latest() {
        let (_kv, store) = store();
        let first = store.add(entry(JobType::Qna, None)).await.unwrap();
        let mut again = entry(JobType::Qna, None);
        again.original_job_id = first.original_job_id;
        let second = store.add(again).await.unwrap();

        let resolved = store.get_by_job_id(first.original_job_id).await.unwrap().unwrap();
        assert_eq!(resolved.dlq_id, second.dlq_id);
        assert!(store.get(first.dlq_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mark_processed_keeps_type_and_project_visibility() {
        let (kv, store) = store();
        let store = store.with_entry_ttl(Duration::from_secs(1000));
        let a = store.add(entry(JobType::TradeScopeExtract, Some("p"))).await.unwrap();
        store.add(entry(JobType::TradeScopeExtract, Some("p"))).await.unwrap();

        let requeued = JobId::new();
        let processed = store.mark_processed(a.dlq_id, Some(requeued)).await.unwrap().unwrap();
        assert_eq!(processed.requeued_job_id, Some(requeued));

        assert_eq!(store.count(&DeadLetterFilter::unprocessed()).await.unwrap(), 1);
        assert_eq!(
            store.count(&DeadLetterFilter::new().job_type(JobType::TradeScopeExtract)).await.unwrap(),
            2
        );
        assert_eq!(store.count(&DeadLetterFilter::new().project("p")).await.unwrap(), 2);
        assert_eq!(store.count(&DeadLetterFilter::new().processed(true)).await.unwrap(), 1);

        // Remaining TTL is preserved, not reset.
        let ttl = kv.ttl(&format!("t:dlq:{}", a.dlq_id)).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn list_paginates_over_index() {
        let (_kv, store) = store();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.add(entry(JobType::Qna, None)).await.unwrap().dlq_id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let page = store
            .list(&DeadLetterFilter::unprocessed(), Pagination::new(Some(2), Some(1)))
            .await
            .unwrap();
        assert_eq!(page.iter().map(|e| e.dlq_id).collect::<Vec<_>>(), vec![ids[3], ids[2]]);

        let all = store.list(&DeadLetterFilter::new(), Pagination::default()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].dlq_id, ids[4]);
    }

    #[tokio::test]
    async fn purge_removes_from_every_index() {
        let (kv, store) = store();
        let a = store.add(entry(JobType::Qna, Some("p"))).await.unwrap();
        let b = store.add(entry(JobType::Qna, Some("p"))).await.unwrap();
        store.mark_processed(a.dlq_id, None).await.unwrap();

        assert_eq!(store.purge(true, Some(chrono::Duration::zero())).await.unwrap(), 1);
        assert!(store.get(a.dlq_id).await.unwrap().is_none());
        assert!(store.get(b.dlq_id).await.unwrap().is_some());
        assert_eq!(kv.zcard("t:dlq_index:type:qna").await.unwrap(), 1);
        assert_eq!(kv.zcard("t:dlq_index:project:p").await.unwrap(), 1);
        assert!(store.get_by_job_id(a.original_job_id).await.unwrap().is_none());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_failure_reason.get("external_service_error"), Some(&1));
    }

    #[tokio::test]
    async fn expired_records_are_pruned_from_indices() {
        let (kv, store) = store();
        let store = store.with_entry_ttl(Duration::from_millis(10));
        store.add(entry(JobType::Qna, None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert_eq!(store.count(&DeadLetterFilter::unprocessed()).await.unwrap(), 0);
        assert_eq!(kv.zcard("t:dlq_index:unprocessed").await.unwrap(), 0);
    }
}
