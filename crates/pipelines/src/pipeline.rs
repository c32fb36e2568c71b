use std::future::Future;

use async_trait::async_trait;
use blueprintx_core::JsonMap;

use crate::context::JobContext;
use crate::result::PipelineError;

/// A document pipeline the engine can dispatch a job to.
///
/// Implementations own their timeout envelope. The engine never cancels an
/// in-flight `run`.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Execute the pipeline on the job input and return its result payload.
    async fn run(&self, input: &JsonMap, ctx: &JobContext) -> Result<JsonMap, PipelineError>;
}

/// Adapter turning an async closure into a `Pipeline`.
pub struct FnPipeline<F>(F);

/// Wrap an async closure as a pipeline handler.
///
/// The closure receives owned copies of the input and context so the returned
/// future can be `'static`.
pub fn pipeline_fn<F, Fut>(f: F) -> FnPipeline<F>
where
    F: Fn(JsonMap, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonMap, PipelineError>> + Send + 'static,
{
    FnPipeline(f)
}

#[async_trait]
impl<F, Fut> Pipeline for FnPipeline<F>
where
    F: Fn(JsonMap, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonMap, PipelineError>> + Send + 'static,
{
    async fn run(&self, input: &JsonMap, ctx: &JobContext) -> Result<JsonMap, PipelineError> {
        (self.0)(input.clone(), ctx.clone()).await
    }
}
