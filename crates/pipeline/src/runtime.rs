//! Wiring of stores, stages, worker, and scheduler into one runnable pipeline.

use std::sync::Arc;

use tracing::info;

use dailycast_core::Clock;
use dailycast_infra::PipelineConfig;
use dailycast_infra::jobs::{
    InMemoryJobStore, JobStore, QueueName, QueueWorker, QueueWorkerConfig, QueueWorkerHandle,
    WorkerStats,
};
use dailycast_infra::lock::{DistributedLock, InMemoryLockStore, LockStore};
use dailycast_infra::repository::{ContentRepository, RepositoryError};

use crate::capabilities::{
    EmbeddingProvider, NarrateCapability, ObjectStore, SummarizeCapability, SynthesizeCapability,
};
use crate::embeddings::{EmbeddingBackfill, EmbeddingBatchHandler};
use crate::orchestrator::Orchestrator;
use crate::schedule::{DailyScheduler, SchedulerHandle};
use crate::stages::{PodcastStage, ScriptStage, StageContext, SummaryStage};

/// External capability clients.
#[derive(Clone)]
pub struct Capabilities {
    pub summarize: Arc<dyn SummarizeCapability>,
    pub narrate: Arc<dyn NarrateCapability>,
    pub synthesize: Arc<dyn SynthesizeCapability>,
    pub storage: Arc<dyn ObjectStore>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("redis url not configured")]
    MissingRedisUrl,
    #[error("lock store: {0}")]
    Lock(#[from] dailycast_infra::lock::LockError),
    #[error("job store: {0}")]
    Queue(#[from] dailycast_infra::jobs::JobStoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Assembled pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<DailyScheduler>,
    backfill: Arc<EmbeddingBackfill>,
    worker: Arc<QueueWorker<Arc<dyn JobStore>>>,
}

impl Pipeline {
    /// Process-local pipeline over in-memory lock and job stores.
    pub fn in_memory(
        config: PipelineConfig,
        repository: Arc<dyn ContentRepository>,
        capabilities: Capabilities,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::with_clock(clock.clone()));
        let jobs: Arc<dyn JobStore> = InMemoryJobStore::arc();
        Self::with_stores(config, repository, capabilities, clock, locks, jobs)
    }

    /// Pipeline sharing locks and queues with other processes through Redis.
    #[cfg(feature = "redis")]
    pub async fn connect(
        config: PipelineConfig,
        repository: Arc<dyn ContentRepository>,
        capabilities: Capabilities,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        use dailycast_infra::jobs::RedisJobStore;
        use dailycast_infra::lock::RedisLockStore;

        let url = config
            .redis_url
            .clone()
            .ok_or(PipelineError::MissingRedisUrl)?;
        let locks: Arc<dyn LockStore> = Arc::new(RedisLockStore::connect(&url).await?);
        let jobs: Arc<dyn JobStore> = Arc::new(RedisJobStore::connect(&url).await?);
        Ok(Self::with_stores(config, repository, capabilities, clock, locks, jobs))
    }

    /// Pipeline over caller-provided lock and job stores.
    pub fn with_stores(
        config: PipelineConfig,
        repository: Arc<dyn ContentRepository>,
        capabilities: Capabilities,
        clock: Arc<dyn Clock>,
        locks: Arc<dyn LockStore>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            jobs.clone(),
            repository.clone(),
            clock.clone(),
        ));
        let backfill = Arc::new(EmbeddingBackfill::new(
            repository.clone(),
            jobs.clone(),
            clock.clone(),
            config.embedding_batch_size,
        ));
        let scheduler = Arc::new(DailyScheduler::new(
            orchestrator.clone(),
            repository.clone(),
            clock.clone(),
            config.time_zone,
        ));

        let ctx = StageContext {
            repository: repository.clone(),
            lock: DistributedLock::new(locks),
            orchestrator: orchestrator.clone(),
            backfill: backfill.clone(),
            clock: clock.clone(),
            config: config.clone(),
        };

        let mut worker = QueueWorker::new(jobs.clone(), clock.clone());
        worker.register_handler(
            QueueName::SummaryGenerate,
            Arc::new(SummaryStage::new(ctx.clone(), capabilities.summarize)),
        );
        worker.register_handler(
            QueueName::ScriptGenerate,
            Arc::new(ScriptStage::new(ctx.clone(), capabilities.narrate)),
        );
        worker.register_handler(
            QueueName::PodcastGenerate,
            Arc::new(PodcastStage::new(
                ctx,
                capabilities.synthesize,
                capabilities.storage,
            )),
        );
        worker.register_handler(
            QueueName::EmbeddingBatch,
            Arc::new(
                EmbeddingBatchHandler::new(repository, capabilities.embeddings, jobs, clock.clone())
                    .with_call_timeout(config.capability_timeout),
            ),
        );

        Self {
            config,
            clock,
            orchestrator,
            scheduler,
            backfill,
            worker: Arc::new(worker),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<DailyScheduler> {
        &self.scheduler
    }

    pub fn backfill(&self) -> &Arc<EmbeddingBackfill> {
        &self.backfill
    }

    pub fn worker(&self) -> &Arc<QueueWorker<Arc<dyn JobStore>>> {
        &self.worker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Load every schedule, then start the queue worker and scheduler loops.
    ///
    /// Installs the process log subscriber first unless one is already set.
    pub async fn start(&self) -> Result<PipelineHandle, PipelineError> {
        dailycast_observability::init();
        let users = self.scheduler.reload_all().await?;
        let worker = self.worker.clone().spawn(
            QueueWorkerConfig::default()
                .with_name("dailycast-worker")
                .with_concurrency(self.config.worker_concurrency),
        );
        let scheduler = self.scheduler.clone().spawn(self.config.scheduler_tick);
        info!(users, concurrency = self.config.worker_concurrency, "pipeline started");
        Ok(PipelineHandle { worker, scheduler })
    }
}

/// Running pipeline loops.
#[derive(Debug)]
pub struct PipelineHandle {
    worker: QueueWorkerHandle,
    scheduler: SchedulerHandle,
}

impl PipelineHandle {
    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    /// Stop the scheduler first, then drain in-flight jobs.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.worker.shutdown().await;
        info!("pipeline stopped");
    }
}
