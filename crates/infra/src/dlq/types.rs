//! Dead-letter entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use blueprintx_core::{DlqId, JobId, JobType, JsonMap};

use crate::jobs::Job;

/// Why a job ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRetriesExceeded,
    PermanentError,
    Timeout,
    InvalidInput,
    ExternalServiceError,
    Unknown,
}

impl FailureReason {
    pub const ALL: [FailureReason; 6] = [
        FailureReason::MaxRetriesExceeded,
        FailureReason::PermanentError,
        FailureReason::Timeout,
        FailureReason::InvalidInput,
        FailureReason::ExternalServiceError,
        FailureReason::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxRetriesExceeded => "max_retries_exceeded",
            FailureReason::PermanentError => "permanent_error",
            FailureReason::Timeout => "timeout",
            FailureReason::InvalidInput => "invalid_input",
            FailureReason::ExternalServiceError => "external_service_error",
            FailureReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminally failed job, kept for inspection and manual replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub dlq_id: DlqId,
    pub original_job_id: JobId,
    pub job_type: JobType,
    #[serde(default)]
    pub job_input: JsonMap,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,

    pub failure_reason: FailureReason,
    /// Truncated message, safe to show in listings
    pub error_message: String,
    /// Full diagnostic (error chain, upstream body, ...)
    #[serde(default)]
    pub error_details: Option<String>,
    pub attempt_count: u32,

    pub original_job_created_at: DateTime<Utc>,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub dlq_created_at: DateTime<Utc>,

    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    /// Job created when the entry was retried
    #[serde(default)]
    pub requeued_job_id: Option<JobId>,
}

impl DeadLetterEntry {
    /// Snapshot a failed job. `first_failure_at` falls back to `now` for jobs that
    /// fail on their first attempt.
    pub fn from_job(
        job: &Job,
        failure_reason: FailureReason,
        error_message: impl Into<String>,
        error_details: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            dlq_id: DlqId::new(),
            original_job_id: job.job_id,
            job_type: job.job_type,
            job_input: job.input.clone(),
            project_id: job.project_id.clone(),
            document_id: job.document_id.clone(),
            created_by: job.created_by.clone(),
            failure_reason,
            error_message: error_message.into(),
            error_details,
            attempt_count: job.attempt_count,
            original_job_created_at: job.created_at,
            first_failure_at: job.first_failure_at.unwrap_or(now),
            last_failure_at: now,
            dlq_created_at: now,
            processed: false,
            processed_at: None,
            requeued_job_id: None,
        }
    }

    pub fn mark_processed(&mut self, requeued_job_id: Option<JobId>, now: DateTime<Utc>) {
        self.processed = true;
        self.processed_at = Some(now);
        if requeued_job_id.is_some() {
            self.requeued_job_id = requeued_job_id;
        }
    }
}

/// Filter for `list` / `count`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub processed: Option<bool>,
    pub job_type: Option<JobType>,
    pub project_id: Option<String>,
}

impl DeadLetterFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unprocessed() -> Self {
        Self {
            processed: Some(false),
            ..Self::default()
        }
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.processed.is_none_or(|p| entry.processed == p)
            && self.job_type.is_none_or(|t| entry.job_type == t)
            && self
                .project_id
                .as_deref()
                .is_none_or(|p| entry.project_id.as_deref() == Some(p))
    }
}

/// Aggregate view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub processed: usize,
    pub unprocessed: usize,
    pub by_failure_reason: std::collections::BTreeMap<String, usize>,
    pub by_job_type: std::collections::BTreeMap<String, usize>,
}

impl DeadLetterStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeadLetterEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            if entry.processed {
                stats.processed += 1;
            } else {
                stats.unprocessed += 1;
            }
            *stats
                .by_failure_reason
                .entry(entry.failure_reason.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_job_type
                .entry(entry.job_type.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }
}
