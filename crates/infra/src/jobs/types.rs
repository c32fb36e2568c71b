//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use blueprintx_core::{JobId, JobType, JsonMap};

/// Default number of attempts before a job is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a (first or retry) attempt
    Queued,
    /// Currently being executed
    Running,
    /// Completed successfully
    Succeeded,
    /// Exhausted retries or failed permanently; has a DLQ entry
    Failed,
    /// Cancelled externally
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff: `base * multiplier^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay = base * exp;

        // Overflow to inf (or a NaN multiplier) means "as long as allowed".
        if !delay.is_finite() || delay >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// A document-processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// Opaque pipeline input
    #[serde(default)]
    pub input: JsonMap,
    /// Pipeline result, only set on success
    #[serde(default)]
    pub output: Option<JsonMap>,
    /// Final error, set when the job fails permanently
    #[serde(default)]
    pub error: Option<String>,
    /// Most recent attempt error, kept across retries
    #[serde(default)]
    pub last_error: Option<String>,
    /// Advisory progress in [0, 1]
    #[serde(default)]
    pub progress: f64,
    pub attempt_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_failure_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Apply a patch in place.
    ///
    /// Stamps `started_at` on the first transition to running and `completed_at`
    /// on any transition to a terminal status. Returns the previous status when
    /// the patch changed it.
    pub fn apply(&mut self, patch: JobPatch, now: DateTime<Utc>) -> Option<JobStatus> {
        let mut previous = None;

        if let Some(status) = patch.status {
            if status != self.status {
                previous = Some(self.status);
                self.status = status;
            }
            if status == JobStatus::Running && self.started_at.is_none() {
                self.started_at = Some(now);
            }
            if status.is_terminal() && previous.is_some() {
                self.completed_at = Some(now);
            }
        }
        if let Some(output) = patch.output {
            self.output = output;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(last_error) = patch.last_error {
            self.last_error = last_error;
        }
        if let Some(progress) = patch.progress {
            self.progress = clamp_progress(progress);
        }
        if let Some(attempt_count) = patch.attempt_count {
            self.attempt_count = attempt_count;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            self.next_retry_at = next_retry_at;
        }
        if let Some(first_failure_at) = patch.first_failure_at {
            self.first_failure_at = first_failure_at;
        }

        previous
    }

    /// Whether a scheduled retry is due.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// First-attempt job that has never been scheduled for retry.
    pub fn is_fresh(&self) -> bool {
        self.status == JobStatus::Queued && self.next_retry_at.is_none()
    }
}

pub(crate) fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Input for `JobStore::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: JobType,
    pub input: JsonMap,
    pub project_id: Option<String>,
    pub document_id: Option<String>,
    pub created_by: Option<String>,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(job_type: JobType, input: JsonMap) -> Self {
        Self {
            job_type,
            input,
            project_id: None,
            document_id: None,
            created_by: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Materialize the job record in the `queued` state.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            job_id: JobId::new(),
            job_type: self.job_type,
            status: JobStatus::Queued,
            input: self.input,
            output: None,
            error: None,
            last_error: None,
            progress: 0.0,
            attempt_count: 0,
            max_retries: self.max_retries,
            next_retry_at: None,
            project_id: self.project_id,
            document_id: self.document_id,
            created_by: self.created_by,
            created_at: now,
            started_at: None,
            completed_at: None,
            first_failure_at: None,
        }
    }
}

/// Partial update of a job.
///
/// Each field is "unset" (`None`, leave as is) or an explicit value. Clearable
/// fields use `Option<Option<T>>` so that `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub output: Option<Option<JsonMap>>,
    pub error: Option<Option<String>>,
    pub last_error: Option<Option<String>>,
    pub progress: Option<f64>,
    pub attempt_count: Option<u32>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub first_failure_at: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn output(mut self, output: JsonMap) -> Self {
        self.output = Some(Some(output));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(Some(at));
        self
    }

    pub fn clear_next_retry_at(mut self) -> Self {
        self.next_retry_at = Some(None);
        self
    }

    pub fn first_failure_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_failure_at = Some(Some(at));
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.succeeded + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queued_job() -> Job {
        NewJob::new(JobType::Qna, JsonMap::new()).into_job(Utc::now())
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(500));
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..60_000,
            max_ms in 1u64..3_600_000,
            multiplier in 1.0f64..10.0,
            attempt in 1u32..200,
        ) {
            let policy = RetryPolicy::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
                multiplier,
            );
            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);

            prop_assert!(current <= policy.max_delay);
            prop_assert!(next <= policy.max_delay);
            prop_assert!(next >= current);
        }
    }

    #[test]
    fn new_job_defaults() {
        let job = queued_job();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.is_fresh());
    }

    #[test]
    fn apply_stamps_lifecycle_timestamps() {
        let mut job = queued_job();
        let t1 = Utc::now();

        let prev = job.apply(JobPatch::new().status(JobStatus::Running), t1);
        assert_eq!(prev, Some(JobStatus::Queued));
        assert_eq!(job.started_at, Some(t1));
        assert!(job.completed_at.is_none());

        // Back to queued for a retry, then running again: first start is kept.
        job.apply(JobPatch::new().status(JobStatus::Queued), t1);
        let t2 = t1 + chrono::Duration::seconds(5);
        job.apply(JobPatch::new().status(JobStatus::Running), t2);
        assert_eq!(job.started_at, Some(t1));

        let t3 = t2 + chrono::Duration::seconds(1);
        job.apply(JobPatch::new().status(JobStatus::Succeeded), t3);
        assert_eq!(job.completed_at, Some(t3));
    }

    #[test]
    fn apply_distinguishes_unset_from_clear() {
        let mut job = queued_job();
        let at = Utc::now();
        job.apply(JobPatch::new().next_retry_at(at).error("boom"), at);
        assert_eq!(job.next_retry_at, Some(at));
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.apply(JobPatch::new().progress(0.5), at);
        assert_eq!(job.next_retry_at, Some(at));
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.apply(JobPatch::new().clear_next_retry_at().clear_error(), at);
        assert_eq!(job.next_retry_at, None);
        assert_eq!(job.error, None);
    }

    #[test]
    fn progress_is_clamped() {
        let mut job = queued_job();
        job.apply(JobPatch::new().progress(4.2), Utc::now());
        assert_eq!(job.progress, 1.0);
        job.apply(JobPatch::new().progress(f64::NAN), Utc::now());
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn job_serializes_type_field() {
        let job = queued_job();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "qna");
        assert_eq!(value["status"], "queued");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn retry_due_needs_elapsed_schedule() {
        let now = Utc::now();
        let mut job = queued_job();
        assert!(!job.retry_due(now));

        job.next_retry_at = Some(now + chrono::Duration::seconds(5));
        assert!(!job.retry_due(now));
        assert!(job.retry_due(now + chrono::Duration::seconds(5)));
    }
}
