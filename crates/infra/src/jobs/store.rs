//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use blueprintx_core::{JobId, JsonMap};

use super::types::{Job, JobPatch, JobStats, JobStatus, NewJob};
use crate::kv::KvError;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// Operation not allowed in the job's current state.
    #[error("job {job_id} is {status}")]
    Conflict { job_id: JobId, status: JobStatus },
    #[error(transparent)]
    Backend(#[from] KvError),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Another writer held the job lock for longer than we were willing to wait.
    #[error("job {0} is locked by another writer")]
    Locked(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for JobStoreError {
    fn from(e: serde_json::Error) -> Self {
        JobStoreError::Serialization(e.to_string())
    }
}

/// Result of the queued → running compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller won the transition; the job is running with its attempt counted.
    Claimed(Job),
    /// The job exists but is not queued (or another caller holds the claim).
    NotClaimable(Job),
    Missing,
}

/// Result of a guarded status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job was in the expected status and the patch was written.
    Applied(Job),
    /// The job had moved on; nothing was written. Carries the stored job.
    Rejected(Job),
    Missing,
}

/// Job store abstraction.
///
/// Absence is never an error: lookups and updates on a missing id return `None`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in the `queued` state.
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Apply a partial update; re-indexes on status change.
    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<Option<Job>, JobStoreError>;

    /// Atomically move a queued job to running: increments `attempt_count` and
    /// clears `next_retry_at`. At most one concurrent caller gets `Claimed`.
    async fn claim(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError>;

    /// Apply `patch` only while the job is still in `expected` status.
    async fn transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<Transition, JobStoreError>;

    /// Cancel a queued or running job. Terminal jobs are a `Conflict`.
    ///
    /// Atomic with respect to `claim` and `transition`: a runner finishing a
    /// cancelled job sees its write rejected.
    async fn cancel(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Newest-created first, optionally filtered by status and/or project.
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Returns false if absent. Queued or running jobs are a `Conflict`.
    async fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Remove terminal jobs that completed more than `older_than` ago.
    async fn purge_terminal(&self, older_than: chrono::Duration) -> Result<usize, JobStoreError>;

    async fn ping(&self) -> Result<(), JobStoreError> {
        Ok(())
    }

    async fn start(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.update(job_id, JobPatch::new().status(JobStatus::Running))
            .await
    }

    async fn complete(&self, job_id: JobId, output: JsonMap) -> Result<Option<Job>, JobStoreError> {
        self.update(
            job_id,
            JobPatch::new()
                .status(JobStatus::Succeeded)
                .progress(1.0)
                .output(output),
        )
        .await
    }

    async fn fail(&self, job_id: JobId, error: String) -> Result<Option<Job>, JobStoreError> {
        self.update(job_id, JobPatch::new().status(JobStatus::Failed).error(error))
            .await
    }
}

pub(crate) fn log_update(job: &Job, previous: Option<JobStatus>) {
    match previous {
        Some(from) => info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            from = %from,
            to = %job.status,
            attempt = job.attempt_count,
            "job status changed"
        ),
        None => debug!(job_id = %job.job_id, status = %job.status, "job updated"),
    }
}

/// Move a non-terminal job to `cancelled`; terminal jobs are a `Conflict`.
pub(crate) fn cancel_in_place(job: &mut Job) -> Result<(), JobStoreError> {
    if job.status.is_terminal() {
        return Err(JobStoreError::Conflict {
            job_id: job.job_id,
            status: job.status,
        });
    }
    let previous = job.apply(JobPatch::new().status(JobStatus::Cancelled), Utc::now());
    log_update(job, previous);
    Ok(())
}

pub(crate) fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.job_id.cmp(&a.job_id))
    });
}

/// Whether a terminal job is old enough to purge.
pub(crate) fn purgeable(job: &Job, cutoff: chrono::DateTime<Utc>) -> bool {
    job.status.is_terminal() && job.completed_at.unwrap_or(job.created_at) <= cutoff
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        let job = new_job.into_job(Utc::now());
        self.write()?.insert(job.job_id, job.clone());
        info!(job_id = %job.job_id, job_type = %job.job_type, "job created");
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let previous = job.apply(patch, Utc::now());
        log_update(job, previous);
        Ok(Some(job.clone()))
    }

    async fn claim(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(ClaimOutcome::Missing);
        };
        if job.status != JobStatus::Queued {
            return Ok(ClaimOutcome::NotClaimable(job.clone()));
        }

        let patch = JobPatch::new()
            .status(JobStatus::Running)
            .attempt_count(job.attempt_count + 1)
            .clear_next_retry_at();
        let previous = job.apply(patch, Utc::now());
        log_update(job, previous);
        Ok(ClaimOutcome::Claimed(job.clone()))
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<Transition, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(Transition::Missing);
        };
        if job.status != expected {
            return Ok(Transition::Rejected(job.clone()));
        }
        let previous = job.apply(patch, Utc::now());
        log_update(job, previous);
        Ok(Transition::Applied(job.clone()))
    }

    async fn cancel(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        cancel_in_place(job)?;
        Ok(Some(job.clone()))
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| {
                status.is_none_or(|s| j.status == s)
                    && project_id.is_none_or(|p| j.project_id.as_deref() == Some(p))
            })
            .cloned()
            .collect();

        sort_newest_first(&mut result);
        result.truncate(limit);
        Ok(result)
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get(&job_id) else {
            return Ok(false);
        };
        if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            return Err(JobStoreError::Conflict {
                job_id,
                status: job.status,
            });
        }
        jobs.remove(&job_id);
        info!(job_id = %job_id, "job deleted");
        Ok(true)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn purge_terminal(&self, older_than: chrono::Duration) -> Result<usize, JobStoreError> {
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, job| !purgeable(job, cutoff));
        let purged = before - jobs.len();
        if purged > 0 {
            info!(purged, "purged old terminal jobs");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueprintx_core::JobType;
    use serde_json::json;

    fn input() -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("question".to_string(), json!("How many doors?"));
        map
    }

    #[tokio::test]
    async fn create_and_claim() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();

        let ClaimOutcome::Claimed(claimed) = store.claim(job.job_id).await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt_count, 1);
        assert!(claimed.started_at.is_some());

        // Second claim loses.
        assert!(matches!(
            store.claim(job.job_id).await.unwrap(),
            ClaimOutcome::NotClaimable(j) if j.attempt_count == 1
        ));
        assert_eq!(store.claim(JobId::new()).await.unwrap(), ClaimOutcome::Missing);
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = InMemoryJobStore::arc();
        let job = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim(job.job_id).await }));
        }

        let mut winners = 0;
        for h in handles {
            if matches!(h.await.unwrap().unwrap(), ClaimOutcome::Claimed(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get(job.job_id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn update_missing_returns_none() {
        let store = InMemoryJobStore::new();
        let updated = store
            .update(JobId::new(), JobPatch::new().progress(0.5))
            .await
            .unwrap();
        assert!(updated.is_none());
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_and_fail_helpers() {
        let store = InMemoryJobStore::new();
        let a = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();
        let b = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();

        let done = store.complete(a.job_id, input()).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.output, Some(input()));
        assert!(done.completed_at.is_some());

        let failed = store.fail(b.job_id, "boom".to_string()).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            let mut new_job = NewJob::new(JobType::PlanSummary, input());
            if i % 2 == 0 {
                new_job = new_job.with_project("p-1");
            }
            ids.push(store.create(new_job).await.unwrap().job_id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.start(ids[2]).await.unwrap();

        let all = store.list_by_status(None, None, 10).await.unwrap();
        let listed: Vec<_> = all.iter().map(|j| j.job_id).collect();
        assert_eq!(listed, vec![ids[3], ids[2], ids[1], ids[0]]);

        let queued_p1 = store
            .list_by_status(Some(JobStatus::Queued), Some("p-1"), 10)
            .await
            .unwrap();
        assert_eq!(queued_p1.len(), 1);
        assert_eq!(queued_p1[0].job_id, ids[0]);

        assert_eq!(store.list_by_status(None, None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_rejects_active_jobs() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();

        assert!(matches!(
            store.delete(job.job_id).await,
            Err(JobStoreError::Conflict { status: JobStatus::Queued, .. })
        ));

        store.cancel(job.job_id).await.unwrap();
        assert!(store.delete(job.job_id).await.unwrap());
        assert!(!store.delete(job.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();
        store.complete(job.job_id, JsonMap::new()).await.unwrap();

        assert!(matches!(
            store.cancel(job.job_id).await,
            Err(JobStoreError::Conflict { status: JobStatus::Succeeded, .. })
        ));
        assert!(store.cancel(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_only_applies_from_expected_status() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();
        store.claim(job.job_id).await.unwrap();

        let cancelled = store.cancel(job.job_id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let outcome = store
            .transition(
                job.job_id,
                JobStatus::Running,
                JobPatch::new().status(JobStatus::Succeeded).progress(1.0),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Transition::Rejected(ref j) if j.status == JobStatus::Cancelled
        ));
        let stored = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.progress, 0.0);

        assert_eq!(
            store
                .transition(JobId::new(), JobStatus::Running, JobPatch::new())
                .await
                .unwrap(),
            Transition::Missing
        );
    }

    #[tokio::test]
    async fn stats_and_purge() {
        let store = InMemoryJobStore::new();
        let a = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();
        let b = store.create(NewJob::new(JobType::Qna, input())).await.unwrap();
        store.create(NewJob::new(JobType::Qna, input())).await.unwrap();

        store.complete(a.job_id, JsonMap::new()).await.unwrap();
        store.fail(b.job_id, "x".to_string()).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);

        // Nothing is older than an hour yet.
        assert_eq!(store.purge_terminal(chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.purge_terminal(chrono::Duration::zero()).await.unwrap(), 2);
        assert_eq!(store.stats().await.unwrap().total(), 1);
    }
}
