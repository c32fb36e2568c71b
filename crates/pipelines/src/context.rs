use std::sync::Arc;

use async_trait::async_trait;
use blueprintx_core::{JobId, JobType};

/// Receives advisory progress updates from a running pipeline.
#[async_trait]
pub trait ProgressSink: Send + Sync + 'static {
    /// `progress` is clamped to \[0, 1\] by the caller.
    async fn report(&self, job_id: JobId, progress: f64);
}

/// Sink that drops every update (tests, one-off invocations).
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _job_id: JobId, _progress: f64) {}
}

/// Everything a pipeline may know about the job it is executing.
///
/// Correlation fields are opaque to the engine; pipelines typically fall back to
/// them when the same value is missing from the job input.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub max_retries: u32,
    pub project_id: Option<String>,
    pub document_id: Option<String>,
    pub created_by: Option<String>,
    progress: Arc<dyn ProgressSink>,
}

impl JobContext {
    pub fn new(job_id: JobId, job_type: JobType, attempt: u32, max_retries: u32) -> Self {
        Self {
            job_id,
            job_type,
            attempt,
            max_retries,
            project_id: None,
            document_id: None,
            created_by: None,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_project(mut self, project_id: Option<String>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn with_document(mut self, document_id: Option<String>) -> Self {
        self.document_id = document_id;
        self
    }

    pub fn with_created_by(mut self, created_by: Option<String>) -> Self {
        self.created_by = created_by;
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }

    /// Report progress in \[0, 1\]. Out-of-range and NaN values are clamped.
    pub async fn report_progress(&self, progress: f64) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        self.progress.report(self.job_id, progress).await;
    }
}

impl core::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("max_retries", &self.max_retries)
            .field("project_id", &self.project_id)
            .field("document_id", &self.document_id)
            .field("created_by", &self.created_by)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<f64>>);

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn report(&self, _job_id: JobId, progress: f64) {
            self.0.lock().unwrap().push(progress);
        }
    }

    #[tokio::test]
    async fn progress_is_clamped_before_reaching_the_sink() {
        let sink = Arc::new(Recorder::default());
        let ctx = JobContext::new(JobId::new(), JobType::Qna, 1, 3).with_progress_sink(sink.clone());

        ctx.report_progress(0.25).await;
        ctx.report_progress(7.0).await;
        ctx.report_progress(-1.0).await;
        ctx.report_progress(f64::NAN).await;

        assert_eq!(*sink.0.lock().unwrap(), vec![0.25, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn last_attempt_tracks_max_retries() {
        assert!(!JobContext::new(JobId::new(), JobType::Qna, 1, 2).is_last_attempt());
        assert!(JobContext::new(JobId::new(), JobType::Qna, 2, 2).is_last_attempt());
    }
}
