use std::sync::Arc;

use blueprintx_core::{JobType, JsonMap};

use crate::context::JobContext;
use crate::pipeline::Pipeline;
use crate::result::PipelineError;

/// Routes each `JobType` to at most one pipeline.
///
/// Every variant has its own slot, so adding a job type forces this match to be
/// extended. A slot left empty surfaces as `PipelineError::UnsupportedJobType`
/// at dispatch time, which the runner treats as non-retryable.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    document_ingest: Option<Arc<dyn Pipeline>>,
    plan_summary: Option<Arc<dyn Pipeline>>,
    trade_scope_extract: Option<Arc<dyn Pipeline>>,
    tender_scope_doc: Option<Arc<dyn Pipeline>>,
    qna: Option<Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, job_type: JobType) -> &Option<Arc<dyn Pipeline>> {
        match job_type {
            JobType::DocumentIngest => &self.document_ingest,
            JobType::PlanSummary => &self.plan_summary,
            JobType::TradeScopeExtract => &self.trade_scope_extract,
            JobType::TenderScopeDoc => &self.tender_scope_doc,
            JobType::Qna => &self.qna,
        }
    }

    fn slot_mut(&mut self, job_type: JobType) -> &mut Option<Arc<dyn Pipeline>> {
        match job_type {
            JobType::DocumentIngest => &mut self.document_ingest,
            JobType::PlanSummary => &mut self.plan_summary,
            JobType::TradeScopeExtract => &mut self.trade_scope_extract,
            JobType::TenderScopeDoc => &mut self.tender_scope_doc,
            JobType::Qna => &mut self.qna,
        }
    }

    /// Register (or replace) the handler for a job type.
    pub fn register<P: Pipeline>(&mut self, job_type: JobType, pipeline: P) -> &mut Self {
        *self.slot_mut(job_type) = Some(Arc::new(pipeline));
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<P: Pipeline>(mut self, job_type: JobType, pipeline: P) -> Self {
        self.register(job_type, pipeline);
        self
    }

    /// Register an already shared handler (e.g. one pipeline serving several types).
    pub fn with_shared(mut self, job_type: JobType, pipeline: Arc<dyn Pipeline>) -> Self {
        *self.slot_mut(job_type) = Some(pipeline);
        self
    }

    pub fn resolve(&self, job_type: JobType) -> Result<Arc<dyn Pipeline>, PipelineError> {
        self.slot(job_type)
            .clone()
            .ok_or(PipelineError::UnsupportedJobType(job_type))
    }

    /// Job types that currently have a handler.
    pub fn registered(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.slot(*t).is_some())
            .collect()
    }

    /// Resolve the handler for `ctx.job_type` and run it.
    pub async fn dispatch(&self, input: &JsonMap, ctx: &JobContext) -> Result<JsonMap, PipelineError> {
        let pipeline = self.resolve(ctx.job_type)?;
        pipeline.run(input, ctx).await
    }
}

impl core::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}
