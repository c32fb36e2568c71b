//! Job store over a key-value backend.
//!
//! ## Layout
//!
//! - `{prefix}job:{id}`: JSON record, expires after the job TTL (reset on every write)
//! - `{prefix}jobs:status:{status}`: sorted set of job ids scored by `created_at`
//! - `{prefix}jobs:project:{project_id}`: sorted set of job ids scored by `created_at`
//! - `{prefix}job_claim:{id}`: short-lived per-job lock (`SET NX PX`) held by
//!   claims, guarded transitions, cancels and updates
//!
//! Index members outliving their record (TTL expiry, crash between writes) are
//! pruned lazily when a listing walks over them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use blueprintx_core::JobId;

use super::store::{
    ClaimOutcome, JobStore, JobStoreError, Transition, cancel_in_place, log_update, purgeable,
    sort_newest_first,
};
use super::types::{Job, JobPatch, JobStats, JobStatus, NewJob};
use crate::kv::{DEFAULT_KEY_PREFIX, KeyValueBackend, timestamp_score};

/// Default record lifetime.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// Job locks only need to cover one read-check-write.
const CLAIM_LOCK_TTL: Duration = Duration::from_secs(30);

/// How long a writer waits for a held job lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(2);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Ids fetched per index page while collecting a listing.
const INDEX_PAGE: usize = 200;

#[derive(Debug, Clone)]
struct JobKeys {
    prefix: String,
}

impl JobKeys {
    fn job_prefix(&self) -> String {
        format!("{}job:", self.prefix)
    }

    fn job(&self, job_id: JobId) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    fn job_pattern(&self) -> String {
        format!("{}*", self.job_prefix())
    }

    fn status(&self, status: JobStatus) -> String {
        format!("{}jobs:status:{}", self.prefix, status.as_str())
    }

    fn project(&self, project_id: &str) -> String {
        format!("{}jobs:project:{}", self.prefix, project_id)
    }

    fn claim(&self, job_id: JobId) -> String {
        format!("{}job_claim:{}", self.prefix, job_id)
    }
}

/// Durable job store backed by any [`KeyValueBackend`].
#[derive(Clone)]
pub struct PersistentJobStore {
    kv: Arc<dyn KeyValueBackend>,
    keys: JobKeys,
    job_ttl: Duration,
}

impl core::fmt::Debug for PersistentJobStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PersistentJobStore")
            .field("prefix", &self.keys.prefix)
            .field("job_ttl", &self.job_ttl)
            .finish_non_exhaustive()
    }
}

impl PersistentJobStore {
    pub fn new(kv: Arc<dyn KeyValueBackend>) -> Self {
        info!(ttl_hours = DEFAULT_JOB_TTL.as_secs() / 3600, "persistent job store initialized");
        Self {
            kv,
            keys: JobKeys {
                prefix: DEFAULT_KEY_PREFIX.to_string(),
            },
            job_ttl: DEFAULT_JOB_TTL,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self
    }

    pub fn with_job_ttl(mut self, ttl: Duration) -> Self {
        self.job_ttl = ttl;
        self
    }

    async fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        let json = serde_json::to_string(job)?;
        self.kv
            .set_ex(&self.keys.job(job.job_id), &json, self.job_ttl)
            .await?;
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.kv.get(&self.keys.job(job_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn reindex_status(
        &self,
        job: &Job,
        previous: Option<JobStatus>,
    ) -> Result<(), JobStoreError> {
        if let Some(previous) = previous {
            let member = job.job_id.to_string();
            self.kv.zrem(&self.keys.status(previous), &member).await?;
            self.kv
                .zadd(
                    &self.keys.status(job.status),
                    &member,
                    timestamp_score(job.created_at),
                )
                .await?;
        }
        Ok(())
    }

    async fn try_lock(&self, job_id: JobId) -> Result<Option<String>, JobStoreError> {
        let token = Uuid::now_v7().to_string();
        let acquired = self
            .kv
            .set_nx_ex(&self.keys.claim(job_id), &token, CLAIM_LOCK_TTL)
            .await?;
        Ok(acquired.then_some(token))
    }

    /// Wait (bounded) for the job lock.
    async fn lock(&self, job_id: JobId) -> Result<String, JobStoreError> {
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;
        loop {
            if let Some(token) = self.try_lock(job_id).await? {
                return Ok(token);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(job_id = %job_id, "gave up waiting for job lock");
                return Err(JobStoreError::Locked(job_id));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn release_claim(&self, job_id: JobId, token: &str) -> Result<(), JobStoreError> {
        let key = self.keys.claim(job_id);
        if self.kv.get(&key).await?.as_deref() == Some(token) {
            self.kv.del(&key).await?;
        }
        Ok(())
    }

    async fn transition_claimed(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        let Some(mut job) = self.load(job_id).await? else {
            return Ok(ClaimOutcome::Missing);
        };
        if job.status != JobStatus::Queued {
            return Ok(ClaimOutcome::NotClaimable(job));
        }

        let patch = JobPatch::new()
            .status(JobStatus::Running)
            .attempt_count(job.attempt_count + 1)
            .clear_next_retry_at();
        let previous = job.apply(patch, Utc::now());
        self.save(&job).await?;
        self.reindex_status(&job, previous).await?;
        log_update(&job, previous);
        Ok(ClaimOutcome::Claimed(job))
    }

    /// Patch under the job lock, optionally only from `expected` status.
    async fn patch_locked(
        &self,
        job_id: JobId,
        expected: Option<JobStatus>,
        patch: JobPatch,
    ) -> Result<Transition, JobStoreError> {
        let token = self.lock(job_id).await?;
        let outcome = self.patch_unlocked(job_id, expected, patch).await;
        self.release_claim(job_id, &token).await?;
        outcome
    }

    async fn patch_unlocked(
        &self,
        job_id: JobId,
        expected: Option<JobStatus>,
        patch: JobPatch,
    ) -> Result<Transition, JobStoreError> {
        let Some(mut job) = self.load(job_id).await? else {
            return Ok(Transition::Missing);
        };
        if expected.is_some_and(|e| job.status != e) {
            return Ok(Transition::Rejected(job));
        }
        let previous = job.apply(patch, Utc::now());
        self.save(&job).await?;
        self.reindex_status(&job, previous).await?;
        log_update(&job, previous);
        Ok(Transition::Applied(job))
    }

    async fn cancel_unlocked(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let Some(mut job) = self.load(job_id).await? else {
            return Ok(None);
        };
        let previous = job.status;
        cancel_in_place(&mut job)?;
        self.save(&job).await?;
        self.reindex_status(&job, Some(previous)).await?;
        Ok(Some(job))
    }

    /// Walk an index newest-first until `limit` matching jobs are found.
    async fn collect_from_index(
        &self,
        index_key: &str,
        status: Option<JobStatus>,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = Vec::new();
        let mut stale = Vec::new();
        let mut offset = 0;

        while jobs.len() < limit {
            let members = self.kv.zrevrange(index_key, offset, Some(INDEX_PAGE)).await?;
            if members.is_empty() {
                break;
            }
            offset += members.len();

            for member in members {
                let job = match member.parse::<JobId>() {
                    Ok(job_id) => self.load(job_id).await?,
                    Err(_) => None,
                };
                let Some(job) = job else {
                    stale.push(member);
                    continue;
                };
                let matches = status.is_none_or(|s| job.status == s)
                    && project_id.is_none_or(|p| job.project_id.as_deref() == Some(p));
                if matches {
                    jobs.push(job);
                    if jobs.len() == limit {
                        break;
                    }
                }
            }
        }

        for member in &stale {
            self.kv.zrem(index_key, member).await?;
        }
        if !stale.is_empty() {
            debug!(index = index_key, pruned = stale.len(), "pruned stale index members");
        }

        sort_newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn load_all(&self) -> Result<Vec<Job>, JobStoreError> {
        let prefix = self.keys.job_prefix();

        let mut jobs = Vec::new();
        for key in self.kv.scan_keys(&self.keys.job_pattern()).await? {
            let Some(job_id) = key
                .strip_prefix(prefix.as_str())
                .and_then(|id| id.parse::<JobId>().ok())
            else {
                continue;
            };
            if let Some(job) = self.load(job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn remove(&self, job: &Job) -> Result<bool, JobStoreError> {
        let member = job.job_id.to_string();
        self.kv.zrem(&self.keys.status(job.status), &member).await?;
        if let Some(project_id) = &job.project_id {
            self.kv.zrem(&self.keys.project(project_id), &member).await?;
        }
        Ok(self.kv.del(&self.keys.job(job.job_id)).await?)
    }
}

#[async_trait]
impl JobStore for PersistentJobStore {
    #[instrument(skip(self, new_job), fields(job_type = %new_job.job_type), err)]
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        let job = new_job.into_job(Utc::now());
        self.save(&job).await?;

        // Indices go after the record: a crash leaves a stale index, never a
        // record that listings cannot reach through its status.
        let member = job.job_id.to_string();
        let score = timestamp_score(job.created_at);
        self.kv
            .zadd(&self.keys.status(job.status), &member, score)
            .await?;
        if let Some(project_id) = &job.project_id {
            self.kv
                .zadd(&self.keys.project(project_id), &member, score)
                .await?;
        }

        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            project_id = ?job.project_id,
            max_retries = job.max_retries,
            "job created"
        );
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.load(job_id).await
    }

    #[instrument(skip(self, patch), err)]
    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<Option<Job>, JobStoreError> {
        Ok(match self.patch_locked(job_id, None, patch).await? {
            Transition::Applied(job) | Transition::Rejected(job) => Some(job),
            Transition::Missing => None,
        })
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        let Some(token) = self.try_lock(job_id).await? else {
            warn!(job_id = %job_id, "job lock held by another writer");
            return Ok(match self.load(job_id).await? {
                Some(job) => ClaimOutcome::NotClaimable(job),
                None => ClaimOutcome::Missing,
            });
        };

        let outcome = self.transition_claimed(job_id).await;
        self.release_claim(job_id, &token).await?;
        outcome
    }

    #[instrument(skip(self, patch), err)]
    async fn transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<Transition, JobStoreError> {
        self.patch_locked(job_id, Some(expected), patch).await
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let token = self.lock(job_id).await?;
        let outcome = self.cancel_unlocked(job_id).await;
        self.release_claim(job_id, &token).await?;
        outcome
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let index_key = match (status, project_id) {
            (Some(status), Some(project_id)) => {
                let status_key = self.keys.status(status);
                let project_key = self.keys.project(project_id);
                if self.kv.zcard(&project_key).await? <= self.kv.zcard(&status_key).await? {
                    project_key
                } else {
                    status_key
                }
            }
            (Some(status), None) => self.keys.status(status),
            (None, Some(project_id)) => self.keys.project(project_id),
            (None, None) => {
                let mut jobs = self.load_all().await?;
                sort_newest_first(&mut jobs);
                jobs.truncate(limit);
                return Ok(jobs);
            }
        };

        self.collect_from_index(&index_key, status, project_id, limit)
            .await
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let Some(job) = self.load(job_id).await? else {
            return Ok(false);
        };
        if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            return Err(JobStoreError::Conflict {
                job_id,
                status: job.status,
            });
        }

        let deleted = self.remove(&job).await?;
        if deleted {
            info!(job_id = %job_id, "job deleted");
        }
        Ok(deleted)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.load_all().await? {
            stats.record(job.status);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn purge_terminal(&self, older_than: chrono::Duration) -> Result<usize, JobStoreError> {
        let cutoff = Utc::now() - older_than;
        let mut purged = 0;
        for job in self.load_all().await? {
            if purgeable(&job, cutoff) && self.remove(&job).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "purged old terminal jobs");
        }
        Ok(purged)
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        Ok(self.kv.ping().await?)
    }
}
