//! Composition root: builds stores, runner and operations from settings.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use blueprintx_pipelines::PipelineRegistry;

use crate::config::{JobSettings, StoreKind};
use crate::dlq::{
    DeadLetterStore, DeadLetterStoreError, InMemoryDeadLetterStore, PersistentDeadLetterStore,
};
use crate::jobs::{
    InMemoryJobStore, JobRunner, JobStore, JobStoreError, PersistentJobStore, RetryPoller,
    RetryPollerHandle,
};
use crate::kv::{KeyValueBackend, KvError};
use crate::operations::JobOperations;

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("key-value backend unavailable: {0}")]
    Backend(#[from] KvError),
    #[error("job store check failed: {0}")]
    JobStore(#[from] JobStoreError),
    #[error("dead-letter store check failed: {0}")]
    DeadLetterStore(#[from] DeadLetterStoreError),
    #[error("{0}")]
    Unsupported(String),
}

/// The assembled job engine.
pub struct JobServices {
    settings: JobSettings,
    runner: Arc<JobRunner>,
    operations: JobOperations,
    shutdown: CancellationToken,
}

impl JobServices {
    /// Build the engine described by `settings`, checking store connectivity.
    pub async fn build(
        settings: JobSettings,
        pipelines: PipelineRegistry,
    ) -> Result<Self, ServicesError> {
        match settings.store {
            StoreKind::Memory => {
                let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
                let dead_letters: Arc<dyn DeadLetterStore> =
                    Arc::new(InMemoryDeadLetterStore::new());
                Self::assemble(settings, jobs, dead_letters, pipelines).await
            }
            StoreKind::Persistent => {
                let kv = connect(&settings).await?;
                Self::build_with_kv(settings, kv, pipelines).await
            }
        }
    }

    /// Build persistent stores over an already connected backend.
    pub async fn build_with_kv(
        settings: JobSettings,
        kv: Arc<dyn KeyValueBackend>,
        pipelines: PipelineRegistry,
    ) -> Result<Self, ServicesError> {
        let jobs: Arc<dyn JobStore> = Arc::new(
            PersistentJobStore::new(kv.clone())
                .with_key_prefix(settings.key_prefix.clone())
                .with_job_ttl(settings.job_ttl),
        );
        let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(
            PersistentDeadLetterStore::new(kv)
                .with_key_prefix(settings.key_prefix.clone())
                .with_entry_ttl(settings.dlq_entry_ttl),
        );
        Self::assemble(settings, jobs, dead_letters, pipelines).await
    }

    async fn assemble(
        settings: JobSettings,
        jobs: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        pipelines: PipelineRegistry,
    ) -> Result<Self, ServicesError> {
        jobs.ping().await?;
        dead_letters.ping().await?;

        let registered: Vec<&str> = pipelines.registered().iter().map(|t| t.as_str()).collect();
        info!(
            store = ?settings.store,
            pipelines = ?registered,
            max_retries = settings.max_retries,
            "job services ready"
        );

        let runner = Arc::new(
            JobRunner::new(jobs, dead_letters, pipelines)
                .with_retry_policy(settings.retry_policy())
                .with_retry_page_size(settings.retry_sweep_page_size),
        );
        let operations =
            JobOperations::new(runner.clone()).with_default_max_retries(settings.max_retries);

        Ok(Self {
            settings,
            runner,
            operations,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn operations(&self) -> &JobOperations {
        &self.operations
    }

    /// Start the background retry sweep. It stops on [`JobServices::shutdown`]
    /// or when the returned handle is shut down.
    pub fn spawn_retry_poller(&self) -> RetryPollerHandle {
        RetryPoller::new(self.runner.clone())
            .with_interval(self.settings.retry_poll_interval)
            .spawn(self.shutdown.child_token())
    }

    /// Signal every background task spawned from these services to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(feature = "redis")]
async fn connect(settings: &JobSettings) -> Result<Arc<dyn KeyValueBackend>, ServicesError> {
    let url = settings
        .redis_url
        .as_deref()
        .ok_or_else(|| ServicesError::Unsupported("REDIS_URL must be set".to_string()))?;
    let kv = crate::kv::RedisKv::connect(url).await?;
    Ok(Arc::new(kv))
}

#[cfg(not(feature = "redis"))]
async fn connect(_settings: &JobSettings) -> Result<Arc<dyn KeyValueBackend>, ServicesError> {
    Err(ServicesError::Unsupported(
        "persistent job store requires the `redis` feature".to_string(),
    ))
}
