//! Job runner: drives a job through claim → pipeline → retry or dead-letter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use blueprintx_core::{DlqId, JobId, JobType};
use blueprintx_pipelines::{JobContext, PipelineError, PipelineRegistry, ProgressSink};

use super::classify::{classify_pipeline_error, is_retryable, truncate_error};
use super::store::{ClaimOutcome, JobStore, JobStoreError, Transition};
use super::types::{Job, JobPatch, JobStatus, RetryPolicy};
use crate::dlq::{DeadLetterEntry, DeadLetterStore, DeadLetterStoreError, FailureReason};

/// Default number of queued jobs examined per sweep.
pub const DEFAULT_RETRY_PAGE_SIZE: usize = 100;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("dead-letter store error: {0}")]
    DeadLetter(#[from] DeadLetterStoreError),
}

/// Lifecycle notifications published by the runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: JobId,
        job_type: JobType,
        attempt: u32,
    },
    Succeeded {
        job_id: JobId,
        job_type: JobType,
        attempt: u32,
    },
    RetryScheduled {
        job_id: JobId,
        attempt: u32,
        reason: FailureReason,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered {
        job_id: JobId,
        dlq_id: DlqId,
        reason: FailureReason,
        attempt: u32,
    },
}

/// Writes pipeline progress straight to the job record. Advisory: failures
/// are logged and swallowed.
struct StoreProgressSink {
    jobs: Arc<dyn JobStore>,
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn report(&self, job_id: JobId, progress: f64) {
        if let Err(e) = self
            .jobs
            .update(job_id, JobPatch::new().progress(progress))
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to record job progress");
        }
    }
}

/// Job execution engine with retry and dead-letter handling.
///
/// The runner is the error boundary for pipelines: a pipeline failure never
/// reaches the caller, it becomes a scheduled retry or a DLQ entry. Only store
/// faults surface as `RunnerError`.
pub struct JobRunner {
    jobs: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    pipelines: PipelineRegistry,
    policy: RetryPolicy,
    retry_page_size: usize,
    events: broadcast::Sender<JobEvent>,
}

impl core::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("pipelines", &self.pipelines)
            .field("policy", &self.policy)
            .field("retry_page_size", &self.retry_page_size)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        pipelines: PipelineRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs,
            dead_letters,
            pipelines,
            policy: RetryPolicy::default(),
            retry_page_size: DEFAULT_RETRY_PAGE_SIZE,
            events,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_page_size(mut self, size: usize) -> Self {
        self.retry_page_size = size.max(1);
        self
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Subscribe to lifecycle events. Slow receivers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run a single attempt of a job.
    ///
    /// Returns `None` for an unknown id and the job unchanged when it is not
    /// queued (or another runner won the claim).
    #[instrument(skip(self))]
    pub async fn run_job(&self, job_id: JobId) -> Result<Option<Job>, RunnerError> {
        let job = match self.jobs.claim(job_id).await? {
            ClaimOutcome::Missing => {
                warn!(job_id = %job_id, "job not found");
                return Ok(None);
            }
            ClaimOutcome::NotClaimable(job) => {
                warn!(job_id = %job_id, status = %job.status, "job not in queued state");
                return Ok(Some(job));
            }
            ClaimOutcome::Claimed(job) => job,
        };

        info!(
            job_id = %job_id,
            job_type = %job.job_type,
            attempt = job.attempt_count,
            max_retries = job.max_retries,
            "starting job"
        );
        self.emit(JobEvent::Started {
            job_id,
            job_type: job.job_type,
            attempt: job.attempt_count,
        });

        let sink: Arc<dyn ProgressSink> = Arc::new(StoreProgressSink {
            jobs: self.jobs.clone(),
        });
        let ctx = JobContext::new(job_id, job.job_type, job.attempt_count, job.max_retries)
            .with_project(job.project_id.clone())
            .with_document(job.document_id.clone())
            .with_created_by(job.created_by.clone())
            .with_progress_sink(sink);

        match self.pipelines.dispatch(&job.input, &ctx).await {
            Ok(output) => {
                let patch = JobPatch::new()
                    .status(JobStatus::Succeeded)
                    .progress(1.0)
                    .output(output);
                let updated = match self.jobs.transition(job_id, JobStatus::Running, patch).await? {
                    Transition::Applied(job) => job,
                    Transition::Rejected(current) => return Ok(Some(discarded(current))),
                    Transition::Missing => return Ok(None),
                };
                info!(
                    job_id = %job_id,
                    job_type = %job.job_type,
                    attempt = job.attempt_count,
                    "job completed successfully"
                );
                self.emit(JobEvent::Succeeded {
                    job_id,
                    job_type: job.job_type,
                    attempt: job.attempt_count,
                });
                Ok(Some(updated))
            }
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    async fn handle_failure(&self, job: Job, err: PipelineError) -> Result<Option<Job>, RunnerError> {
        let job_id = job.job_id;
        let attempt = job.attempt_count;
        let message = truncate_error(&err.to_string());
        let details = err
            .details()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{err:?}"));
        let reason = classify_pipeline_error(&err);
        let now = Utc::now();

        error!(
            job_id = %job_id,
            job_type = %job.job_type,
            attempt,
            error = %message,
            failure_reason = %reason,
            "job execution failed"
        );

        if is_retryable(reason) && attempt < job.max_retries {
            let delay = self.policy.delay_for_attempt(attempt);
            let next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            let patch = JobPatch::new()
                .status(JobStatus::Queued)
                .progress(0.0)
                .last_error(message)
                .next_retry_at(next_retry_at)
                .first_failure_at(job.first_failure_at.unwrap_or(now));
            let updated = match self.jobs.transition(job_id, JobStatus::Running, patch).await? {
                Transition::Applied(job) => job,
                Transition::Rejected(current) => return Ok(Some(discarded(current))),
                Transition::Missing => return Ok(None),
            };

            info!(
                job_id = %job_id,
                attempt,
                next_retry_at = %next_retry_at,
                delay_secs = delay.as_secs_f64(),
                "job scheduled for retry"
            );
            self.emit(JobEvent::RetryScheduled {
                job_id,
                attempt,
                reason,
                next_retry_at,
            });
            return Ok(Some(updated));
        }

        let final_reason = if attempt >= job.max_retries {
            FailureReason::MaxRetriesExceeded
        } else {
            reason
        };

        // Snapshot the latest state (progress updates may have landed meanwhile).
        let Some(snapshot) = self.jobs.get(job_id).await? else {
            return Ok(None);
        };
        if snapshot.status != JobStatus::Running {
            return Ok(Some(discarded(snapshot)));
        }
        let entry = DeadLetterEntry::from_job(&snapshot, final_reason, message.clone(), Some(details), now);
        let entry = self.dead_letters.add(entry).await?;

        let patch = JobPatch::new().status(JobStatus::Failed).error(message);
        let updated = match self.jobs.transition(job_id, JobStatus::Running, patch).await? {
            Transition::Applied(job) => job,
            outcome => {
                // Lost the race after enqueueing; withdraw the entry.
                self.dead_letters.delete(entry.dlq_id).await?;
                return Ok(match outcome {
                    Transition::Rejected(current) => Some(discarded(current)),
                    _ => None,
                });
            }
        };

        error!(
            job_id = %job_id,
            dlq_id = %entry.dlq_id,
            attempt,
            failure_reason = %final_reason,
            "job failed permanently"
        );
        self.emit(JobEvent::DeadLettered {
            job_id,
            dlq_id: entry.dlq_id,
            reason: final_reason,
            attempt,
        });
        Ok(Some(updated))
    }

    /// Run a job to a final state, sleeping in-process between retries.
    ///
    /// May block for the whole retry horizon; spawn it when that matters.
    #[instrument(skip(self))]
    pub async fn run_job_with_immediate_retry(
        &self,
        job_id: JobId,
    ) -> Result<Option<Job>, RunnerError> {
        loop {
            let Some(job) = self.run_job(job_id).await? else {
                return Ok(None);
            };

            match (job.status, job.next_retry_at) {
                (JobStatus::Queued, Some(at)) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(job_id = %job_id, wait_ms = wait.as_millis() as u64, "waiting for retry");
                    tokio::time::sleep(wait).await;
                }
                // Terminal, or owned by another runner.
                _ => return Ok(Some(job)),
            }
        }
    }

    /// Run one attempt of every queued job whose retry is due.
    ///
    /// Returns how many jobs were attempted. A failing job does not stop the sweep.
    #[instrument(skip(self))]
    pub async fn process_retry_jobs(&self) -> Result<usize, RunnerError> {
        let now = Utc::now();
        let queued = self
            .jobs
            .list_by_status(Some(JobStatus::Queued), None, self.retry_page_size)
            .await?;

        let mut attempted = 0;
        for job in queued.into_iter().filter(|j| j.retry_due(now)) {
            attempted += 1;
            if let Err(e) = self.run_job(job.job_id).await {
                error!(job_id = %job.job_id, error = %e, "retry attempt failed");
            }
        }

        if attempted > 0 {
            info!(attempted, "processed retry jobs");
        }
        Ok(attempted)
    }

    /// Run up to `max` first-attempt queued jobs to completion (with retries).
    #[instrument(skip(self))]
    pub async fn process_pending_jobs(&self, max: usize) -> Result<usize, RunnerError> {
        if max == 0 {
            return Ok(0);
        }
        let queued = self
            .jobs
            .list_by_status(
                Some(JobStatus::Queued),
                None,
                self.retry_page_size.max(max),
            )
            .await?;

        let mut processed = 0;
        for job in queued.into_iter().filter(Job::is_fresh).take(max) {
            processed += 1;
            if let Err(e) = self.run_job_with_immediate_retry(job.job_id).await {
                error!(job_id = %job.job_id, error = %e, "pending job failed");
            }
        }

        if processed > 0 {
            info!(processed, "processed pending jobs");
        }
        Ok(processed)
    }
}

/// The job left `running` (cancelled) while its pipeline ran.
fn discarded(current: Job) -> Job {
    warn!(
        job_id = %current.job_id,
        status = %current.status,
        "job left running state during execution; result discarded"
    );
    current
}
