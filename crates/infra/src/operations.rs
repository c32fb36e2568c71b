//! Operator-facing job and dead-letter operations.
//!
//! Thin orchestration over the stores and the runner. Lookups of unknown ids
//! return `Ok(None)`; state guards surface as [`OperationError::Conflict`].

use std::sync::Arc;

use tracing::{info, instrument, warn};

use blueprintx_core::{DlqId, JobId, JobType, JsonMap};

use crate::dlq::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterStats, DeadLetterStore, DeadLetterStoreError,
    Pagination,
};
use crate::jobs::{
    Job, JobRunner, JobStats, JobStatus, JobStore, JobStoreError, NewJob, RunnerError,
    DEFAULT_MAX_RETRIES,
};

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// The target exists but is in the wrong state for the request.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Jobs(JobStoreError),
    #[error(transparent)]
    DeadLetters(#[from] DeadLetterStoreError),
}

impl From<JobStoreError> for OperationError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Conflict { .. } => OperationError::Conflict(err.to_string()),
            other => OperationError::Jobs(other),
        }
    }
}

impl From<RunnerError> for OperationError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Store(e) => e.into(),
            RunnerError::DeadLetter(e) => e.into(),
        }
    }
}

pub struct JobOperations {
    runner: Arc<JobRunner>,
    default_max_retries: u32,
}

impl JobOperations {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self {
            runner,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    fn jobs(&self) -> &Arc<dyn JobStore> {
        self.runner.jobs()
    }

    fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        self.runner.dead_letters()
    }

    /// A job request carrying the configured retry budget.
    pub fn new_job(&self, job_type: JobType, input: JsonMap) -> NewJob {
        NewJob::new(job_type, input).with_max_retries(self.default_max_retries)
    }

    #[instrument(skip(self, new_job), fields(job_type = %new_job.job_type))]
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job, OperationError> {
        Ok(self.jobs().create(new_job).await?)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, OperationError> {
        Ok(self.jobs().get(job_id).await?)
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, OperationError> {
        Ok(self.jobs().list_by_status(status, project_id, limit).await?)
    }

    /// Execute one attempt now. Only queued jobs can be run.
    #[instrument(skip(self))]
    pub async fn run_job_now(&self, job_id: JobId) -> Result<Option<Job>, OperationError> {
        let Some(job) = self.jobs().get(job_id).await? else {
            return Ok(None);
        };
        if job.status != JobStatus::Queued {
            return Err(OperationError::Conflict(format!(
                "job {job_id} is {}, only queued jobs can be run",
                job.status
            )));
        }
        Ok(self.runner.run_job(job_id).await?)
    }

    /// Cancel a non-terminal job.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Option<Job>, OperationError> {
        Ok(self.jobs().cancel(job_id).await?)
    }

    /// Delete a job. Queued and running jobs are refused.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: JobId) -> Result<bool, OperationError> {
        Ok(self.jobs().delete(job_id).await?)
    }

    pub async fn job_stats(&self) -> Result<JobStats, OperationError> {
        Ok(self.jobs().stats().await?)
    }

    /// Remove terminal jobs completed more than `older_than` ago.
    pub async fn purge_terminal_jobs(
        &self,
        older_than: chrono::Duration,
    ) -> Result<usize, OperationError> {
        let purged = self.jobs().purge_terminal(older_than).await?;
        if purged > 0 {
            info!(purged, "purged terminal jobs");
        }
        Ok(purged)
    }

    pub async fn get_dead_letter(
        &self,
        dlq_id: DlqId,
    ) -> Result<Option<DeadLetterEntry>, OperationError> {
        Ok(self.dead_letters().get(dlq_id).await?)
    }

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, OperationError> {
        Ok(self.dead_letters().list(filter, page).await?)
    }

    /// Requeue a dead-lettered job as a brand-new job.
    ///
    /// The entry is marked processed and linked to the new job. `max_retries`
    /// defaults to the configured budget.
    #[instrument(skip(self))]
    pub async fn retry_dead_letter(
        &self,
        dlq_id: DlqId,
        max_retries: Option<u32>,
    ) -> Result<Option<Job>, OperationError> {
        let Some(entry) = self.dead_letters().get(dlq_id).await? else {
            return Ok(None);
        };
        if entry.processed {
            warn!(dlq_id = %dlq_id, "dead-letter entry already processed");
            return Err(OperationError::Conflict(format!(
                "dead-letter entry {dlq_id} is already processed"
            )));
        }

        let mut new_job = NewJob::new(entry.job_type, entry.job_input.clone())
            .with_max_retries(max_retries.unwrap_or(self.default_max_retries));
        new_job.project_id = entry.project_id.clone();
        new_job.document_id = entry.document_id.clone();
        new_job.created_by = entry.created_by.clone();

        let job = self.jobs().create(new_job).await?;
        self.dead_letters()
            .mark_processed(dlq_id, Some(job.job_id))
            .await?;

        info!(
            dlq_id = %dlq_id,
            original_job_id = %entry.original_job_id,
            new_job_id = %job.job_id,
            "dead-letter entry requeued"
        );
        Ok(Some(job))
    }

    /// Requeue a dead-lettered job and run it to a final state in place.
    ///
    /// Retries sleep in-process, so this can take as long as the whole backoff
    /// schedule.
    pub async fn retry_dead_letter_and_run(
        &self,
        dlq_id: DlqId,
        max_retries: Option<u32>,
    ) -> Result<Option<Job>, OperationError> {
        let Some(job) = self.retry_dead_letter(dlq_id, max_retries).await? else {
            return Ok(None);
        };
        Ok(self.runner.run_job_with_immediate_retry(job.job_id).await?)
    }

    /// Mark an entry as handled without requeueing it.
    #[instrument(skip(self))]
    pub async fn acknowledge_dead_letter(
        &self,
        dlq_id: DlqId,
    ) -> Result<Option<DeadLetterEntry>, OperationError> {
        let Some(entry) = self.dead_letters().get(dlq_id).await? else {
            return Ok(None);
        };
        if entry.processed {
            return Err(OperationError::Conflict(format!(
                "dead-letter entry {dlq_id} is already processed"
            )));
        }
        let updated = self.dead_letters().mark_processed(dlq_id, None).await?;
        info!(dlq_id = %dlq_id, "dead-letter entry acknowledged");
        Ok(updated)
    }

    pub async fn delete_dead_letter(&self, dlq_id: DlqId) -> Result<bool, OperationError> {
        Ok(self.dead_letters().delete(dlq_id).await?)
    }

    pub async fn purge_dead_letters(
        &self,
        processed_only: bool,
        older_than: Option<chrono::Duration>,
    ) -> Result<usize, OperationError> {
        Ok(self.dead_letters().purge(processed_only, older_than).await?)
    }

    pub async fn dead_letter_stats(&self) -> Result<DeadLetterStats, OperationError> {
        Ok(self.dead_letters().stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::InMemoryDeadLetterStore;
    use crate::jobs::InMemoryJobStore;
    use blueprintx_pipelines::{pipeline_fn, JobContext, PipelineError, PipelineRegistry};

    fn operations(registry: PipelineRegistry) -> JobOperations {
        let runner = JobRunner::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryDeadLetterStore::new()),
            registry,
        );
        JobOperations::new(Arc::new(runner)).with_default_max_retries(4)
    }

    fn flaky() -> PipelineRegistry {
        PipelineRegistry::new().with(
            JobType::Qna,
            pipeline_fn(|input: JsonMap, _: JobContext| async move {
                if input.contains_key("fixed") {
                    Ok(JsonMap::new())
                } else {
                    Err(PipelineError::invalid_input("question is required"))
                }
            }),
        )
    }

    #[tokio::test]
    async fn new_job_uses_configured_retry_budget() {
        let ops = operations(flaky());
        let job = ops.create_job(ops.new_job(JobType::Qna, JsonMap::new())).await.unwrap();
        assert_eq!(job.max_retries, 4);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn run_now_requires_queued_job() {
        let ops = operations(flaky());
        assert!(ops.run_job_now(JobId::new()).await.unwrap().is_none());

        let job = ops.create_job(ops.new_job(JobType::Qna, JsonMap::new())).await.unwrap();
        let failed = ops.run_job_now(job.job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let err = ops.run_job_now(job.job_id).await.unwrap_err();
        assert!(matches!(err, OperationError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_refuses_active_jobs() {
        let ops = operations(flaky());
        let job = ops.create_job(ops.new_job(JobType::Qna, JsonMap::new())).await.unwrap();
        assert!(matches!(
            ops.delete_job(job.job_id).await,
            Err(OperationError::Conflict(_))
        ));

        ops.cancel_job(job.job_id).await.unwrap();
        assert!(ops.delete_job(job.job_id).await.unwrap());
        assert!(!ops.delete_job(job.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn retry_dead_letter_creates_linked_job_once() {
        let ops = operations(flaky());
        let job = ops
            .create_job(ops.new_job(JobType::Qna, JsonMap::new()).with_project("proj-9"))
            .await
            .unwrap();
        ops.run_job_now(job.job_id).await.unwrap();

        let entry = ops
            .runner()
            .dead_letters()
            .get_by_job_id(job.job_id)
            .await
            .unwrap()
            .unwrap();

        let requeued = ops.retry_dead_letter(entry.dlq_id, Some(1)).await.unwrap().unwrap();
        assert_ne!(requeued.job_id, job.job_id);
        assert_eq!(requeued.max_retries, 1);
        assert_eq!(requeued.project_id.as_deref(), Some("proj-9"));
        assert_eq!(requeued.status, JobStatus::Queued);

        let processed = ops.get_dead_letter(entry.dlq_id).await.unwrap().unwrap();
        assert!(processed.processed);
        assert_eq!(processed.requeued_job_id, Some(requeued.job_id));

        assert!(matches!(
            ops.retry_dead_letter(entry.dlq_id, None).await,
            Err(OperationError::Conflict(_))
        ));
        assert!(matches!(
            ops.acknowledge_dead_letter(entry.dlq_id).await,
            Err(OperationError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn acknowledge_and_stats() {
        let ops = operations(flaky());
        for _ in 0..2 {
            let job = ops.create_job(ops.new_job(JobType::Qna, JsonMap::new())).await.unwrap();
            ops.run_job_now(job.job_id).await.unwrap();
        }
        let entries = ops
            .list_dead_letters(&DeadLetterFilter::unprocessed(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);

        let acked = ops.acknowledge_dead_letter(entries[0].dlq_id).await.unwrap().unwrap();
        assert!(acked.processed);
        assert!(acked.requeued_job_id.is_none());

        let stats = ops.dead_letter_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.unprocessed, 1);
        assert_eq!(stats.by_failure_reason.get("invalid_input"), Some(&2));
        assert_eq!(stats.by_job_type.get("qna"), Some(&2));

        assert!(ops.acknowledge_dead_letter(DlqId::new()).await.unwrap().is_none());
        assert!(ops.retry_dead_letter(DlqId::new(), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_and_run_drives_new_job_to_final_state() {
        let ops = operations(flaky());
        let job = ops.create_job(ops.new_job(JobType::Qna, JsonMap::new())).await.unwrap();
        ops.run_job_now(job.job_id).await.unwrap();
        let entry = ops
            .runner()
            .dead_letters()
            .get_by_job_id(job.job_id)
            .await
            .unwrap()
            .unwrap();

        // Still failing input: the new job dead-letters in turn.
        let rerun = ops
            .retry_dead_letter_and_run(entry.dlq_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rerun.status, JobStatus::Failed);
        assert_eq!(rerun.attempt_count, 1);
        assert_eq!(ops.dead_letter_stats().await.unwrap().total, 2);
    }
}
