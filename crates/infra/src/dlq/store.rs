//! Dead-letter storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use blueprintx_core::{DlqId, JobId};

use super::types::{DeadLetterEntry, DeadLetterFilter, DeadLetterStats};
use crate::kv::KvError;

/// Pagination parameters for dead-letter listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of entries to return.
    pub limit: usize,
    /// Offset for pagination (0-based).
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: usize = 1000;

    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(100).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterStoreError {
    #[error(transparent)]
    Backend(#[from] KvError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for DeadLetterStoreError {
    fn from(e: serde_json::Error) -> Self {
        DeadLetterStoreError::Serialization(e.to_string())
    }
}

/// Storage for terminally failed jobs.
///
/// Several entries may exist for the same original job (retried from the queue,
/// then failed again). They coexist; `get_by_job_id` resolves to the most
/// recently added one.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn add(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry, DeadLetterStoreError>;

    async fn get(&self, dlq_id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError>;

    async fn get_by_job_id(
        &self,
        job_id: JobId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError>;

    /// Newest first.
    async fn list(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError>;

    async fn count(&self, filter: &DeadLetterFilter) -> Result<usize, DeadLetterStoreError>;

    /// Flag an entry as handled. It leaves the unprocessed listing but stays
    /// visible under its type and project.
    async fn mark_processed(
        &self,
        dlq_id: DlqId,
        requeued_job_id: Option<JobId>,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError>;

    async fn delete(&self, dlq_id: DlqId) -> Result<bool, DeadLetterStoreError>;

    /// Delete entries (optionally only processed ones) created at least
    /// `older_than` ago. Returns the number deleted.
    async fn purge(
        &self,
        processed_only: bool,
        older_than: Option<chrono::Duration>,
    ) -> Result<usize, DeadLetterStoreError>;

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterStoreError>;

    async fn ping(&self) -> Result<(), DeadLetterStoreError> {
        Ok(())
    }
}

pub(crate) fn sort_newest_first(entries: &mut [DeadLetterEntry]) {
    entries.sort_by(|a, b| {
        b.dlq_created_at
            .cmp(&a.dlq_created_at)
            .then_with(|| b.dlq_id.cmp(&a.dlq_id))
    });
}

pub(crate) fn purge_matches(
    entry: &DeadLetterEntry,
    processed_only: bool,
    cutoff: Option<chrono::DateTime<Utc>>,
) -> bool {
    (!processed_only || entry.processed) && cutoff.is_none_or(|c| entry.dlq_created_at <= c)
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<DlqId, DeadLetterEntry>,
    by_job_id: HashMap<JobId, DlqId>,
}

impl Inner {
    fn remove(&mut self, dlq_id: DlqId) -> Option<DeadLetterEntry> {
        let entry = self.entries.remove(&dlq_id)?;
        if self.by_job_id.get(&entry.original_job_id) == Some(&dlq_id) {
            self.by_job_id.remove(&entry.original_job_id);
        }
        Some(entry)
    }
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    inner: RwLock<Inner>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, DeadLetterStoreError> {
        self.inner
            .read()
            .map_err(|_| DeadLetterStoreError::Storage("dlq store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, DeadLetterStoreError> {
        self.inner
            .write()
            .map_err(|_| DeadLetterStoreError::Storage("dlq store lock poisoned".to_string()))
    }

    fn matching(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        let inner = self.read()?;
        let mut entries: Vec<_> = inner
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        sort_newest_first(&mut entries);
        Ok(entries)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn add(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry, DeadLetterStoreError> {
        let mut inner = self.write()?;
        inner.by_job_id.insert(entry.original_job_id, entry.dlq_id);
        inner.entries.insert(entry.dlq_id, entry.clone());
        info!(
            dlq_id = %entry.dlq_id,
            job_id = %entry.original_job_id,
            failure_reason = %entry.failure_reason,
            "dead-letter entry added"
        );
        Ok(entry)
    }

    async fn get(&self, dlq_id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        Ok(self.read()?.entries.get(&dlq_id).cloned())
    }

    async fn get_by_job_id(
        &self,
        job_id: JobId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_job_id
            .get(&job_id)
            .and_then(|id| inner.entries.get(id))
            .cloned())
    }

    async fn list(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        Ok(self
            .matching(filter)?
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn count(&self, filter: &DeadLetterFilter) -> Result<usize, DeadLetterStoreError> {
        let inner = self.read()?;
        Ok(inner.entries.values().filter(|e| filter.matches(e)).count())
    }

    async fn mark_processed(
        &self,
        dlq_id: DlqId,
        requeued_job_id: Option<JobId>,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let mut inner = self.write()?;
        let Some(entry) = inner.entries.get_mut(&dlq_id) else {
            return Ok(None);
        };
        entry.mark_processed(requeued_job_id, Utc::now());
        info!(dlq_id = %dlq_id, requeued_job_id = ?requeued_job_id, "dead-letter entry processed");
        Ok(Some(entry.clone()))
    }

    async fn delete(&self, dlq_id: DlqId) -> Result<bool, DeadLetterStoreError> {
        let removed = self.write()?.remove(dlq_id).is_some();
        if removed {
            info!(dlq_id = %dlq_id, "dead-letter entry deleted");
        }
        Ok(removed)
    }

    async fn purge(
        &self,
        processed_only: bool,
        older_than: Option<chrono::Duration>,
    ) -> Result<usize, DeadLetterStoreError> {
        let cutoff = older_than.map(|d| Utc::now() - d);
        let mut inner = self.write()?;
        let doomed: Vec<DlqId> = inner
            .entries
            .values()
            .filter(|e| purge_matches(e, processed_only, cutoff))
            .map(|e| e.dlq_id)
            .collect();
        for dlq_id in &doomed {
            inner.remove(*dlq_id);
        }
        info!(deleted = doomed.len(), processed_only, "dead-letter queue purged");
        Ok(doomed.len())
    }

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterStoreError> {
        let inner = self.read()?;
        Ok(DeadLetterStats::from_entries(inner.entries.values()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::FailureReason;
    use crate::jobs::NewJob;
    use blueprintx_core::{JobType, JsonMap};

    fn entry(job_type: JobType, project: Option<&str>) -> DeadLetterEntry {
        let mut new_job = NewJob::new(job_type, JsonMap::new());
        if let Some(p) = project {
            new_job = new_job.with_project(p);
        }
        let job = new_job.into_job(Utc::now());
        DeadLetterEntry::from_job(&job, FailureReason::Unknown, "boom", None, Utc::now())
    }

    #[test]
    fn pagination_caps_limit() {
        assert_eq!(Pagination::new(Some(5000), None).limit, Pagination::MAX_LIMIT);
        assert_eq!(Pagination::new(None, Some(3)), Pagination { limit: 100, offset: 3 });
    }

    #[tokio::test]
    async fn job_id_index_resolves_to_latest_entry() {
        let store = InMemoryDeadLetterStore::new();
        let first = store.add(entry(JobType::Qna, None)).await.unwrap();
        assert_eq!(
            store.get_by_job_id(first.original_job_id).await.unwrap().map(|e| e.dlq_id),
            Some(first.dlq_id)
        );

        let mut again = entry(JobType::Qna, None);
        again.original_job_id = first.original_job_id;
        let second = store.add(again).await.unwrap();

        assert_eq!(
            store.get_by_job_id(first.original_job_id).await.unwrap().map(|e| e.dlq_id),
            Some(second.dlq_id)
        );
        // Both entries remain for audit.
        assert_eq!(store.count(&DeadLetterFilter::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mark_processed_only_leaves_unprocessed_listing() {
        let store = InMemoryDeadLetterStore::new();
        let a = store.add(entry(JobType::PlanSummary, Some("p"))).await.unwrap();
        store.add(entry(JobType::PlanSummary, Some("p"))).await.unwrap();

        let by_type = DeadLetterFilter::new().job_type(JobType::PlanSummary);
        assert_eq!(store.count(&DeadLetterFilter::unprocessed()).await.unwrap(), 2);
        assert_eq!(store.count(&by_type).await.unwrap(), 2);

        let processed = store.mark_processed(a.dlq_id, None).await.unwrap().unwrap();
        assert!(processed.processed);
        assert!(processed.processed_at.is_some());

        assert_eq!(store.count(&DeadLetterFilter::unprocessed()).await.unwrap(), 1);
        assert_eq!(store.count(&by_type).await.unwrap(), 2);
        assert_eq!(store.count(&DeadLetterFilter::new().project("p")).await.unwrap(), 2);

        assert!(store.mark_processed(DlqId::new(), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_processed_keeps_unprocessed() {
        let store = InMemoryDeadLetterStore::new();
        let a = store.add(entry(JobType::Qna, None)).await.unwrap();
        let b = store.add(entry(JobType::Qna, None)).await.unwrap();
        store.mark_processed(a.dlq_id, None).await.unwrap();

        let deleted = store.purge(true, Some(chrono::Duration::zero())).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(a.dlq_id).await.unwrap().is_none());
        assert!(store.get_by_job_id(a.original_job_id).await.unwrap().is_none());
        assert!(store.get(b.dlq_id).await.unwrap().is_some());

        // Too young to purge.
        assert_eq!(store.purge(false, Some(chrono::Duration::hours(1))).await.unwrap(), 0);
        assert_eq!(store.purge(false, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paginated() {
        let store = InMemoryDeadLetterStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.add(entry(JobType::Qna, None)).await.unwrap().dlq_id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let all = store.list(&DeadLetterFilter::new(), Pagination::default()).await.unwrap();
        assert_eq!(all.iter().map(|e| e.dlq_id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);

        let page = store
            .list(&DeadLetterFilter::new(), Pagination::new(Some(1), Some(1)))
            .await
            .unwrap();
        assert_eq!(page[0].dlq_id, ids[1]);
    }

    #[tokio::test]
    async fn delete_and_stats() {
        let store = InMemoryDeadLetterStore::new();
        let a = store.add(entry(JobType::Qna, None)).await.unwrap();
        store.add(entry(JobType::TenderScopeDoc, None)).await.unwrap();
        store.mark_processed(a.dlq_id, None).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.unprocessed, 1);
        assert_eq!(stats.by_job_type.get("qna"), Some(&1));
        assert_eq!(stats.by_failure_reason.get("unknown"), Some(&2));

        assert!(store.delete(a.dlq_id).await.unwrap());
        assert!(!store.delete(a.dlq_id).await.unwrap());
    }
}
