//! Wiring of the service, orchestrator and worker pool over shared backends.

use std::sync::Arc;

use crate::broker::{Broker, MemoryBroker, TaskConsumer, TaskProducer};
use crate::config::Config;
use crate::error::Result;
use crate::orchestrator::{OrchestratorOptions, TaskOrchestrator};
use crate::pipeline::ImagePipeline;
use crate::service::ImageService;
use crate::stats::StatsService;
use crate::storage::{MemoryImageRepository, MemoryObjectStore, MemoryStatsRepository};
use crate::worker::WorkerPool;

/// A complete single-process deployment: upload API plus workers.
pub struct Lumen {
    config: Config,
    broker: MemoryBroker,
    service: Arc<ImageService>,
    orchestrator: Arc<TaskOrchestrator>,
    stats: Arc<StatsService>,
}

impl Lumen {
    /// Build every component over the in-memory backends and provision the topic.
    pub async fn in_memory(config: Config) -> Result<Self> {
        tracing::debug!("Initializing Lumen v{}", crate::VERSION);

        let broker = MemoryBroker::from_config(&config.broker);
        broker
            .ensure_topic(
                &config.broker.topic,
                config.broker.partitions,
                config.broker.replication_factor,
            )
            .await?;

        let objects = Arc::new(MemoryObjectStore::new(config.storage.bucket.clone()));
        let images = Arc::new(MemoryImageRepository::new());
        let stats = Arc::new(StatsService::new(Arc::new(MemoryStatsRepository::new())));
        let pipeline = Arc::new(ImagePipeline::new(&config));
        let producer = Arc::new(TaskProducer::new(
            Arc::new(broker.clone()),
            config.broker.topic.clone(),
        ));

        let service = Arc::new(ImageService::new(
            &config,
            Arc::clone(&pipeline),
            objects.clone(),
            images.clone(),
            Arc::clone(&stats),
            producer,
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            pipeline,
            objects,
            images,
            Arc::clone(&stats),
            OrchestratorOptions::from_config(&config.worker),
        ));

        Ok(Self {
            config,
            broker,
            service,
            orchestrator,
            stats,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> Arc<ImageService> {
        Arc::clone(&self.service)
    }

    pub fn stats(&self) -> Arc<StatsService> {
        Arc::clone(&self.stats)
    }

    pub fn orchestrator(&self) -> Arc<TaskOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// A worker pool consuming the task topic as the configured consumer group.
    pub fn worker_pool(&self) -> WorkerPool {
        let subscription = self
            .broker
            .subscribe(&self.config.broker.topic, &self.config.broker.consumer_group);
        let consumer = Arc::new(TaskConsumer::new(
            Arc::new(subscription),
            self.config.broker.batch_fetch_timeout(),
        ));
        WorkerPool::from_config(consumer, self.orchestrator(), &self.config.worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::codec::fixtures;
    use crate::types::{ImageStatus, OperationKind, OperationParams};
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_memory_provisions_topic() {
        let lumen = Lumen::in_memory(Config::default()).await.unwrap();
        assert_eq!(lumen.broker.partitions("image-processing"), Some(3));
        assert_eq!(lumen.config().worker.num_workers, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_uploaded_image_is_processed_by_pool() {
        let lumen = Lumen::in_memory(Config::default()).await.unwrap();
        let pool = lumen.worker_pool();
        let cancel = pool.cancel_token();
        let run = tokio::spawn(pool.run(std::future::pending()));

        let service = lumen.service();
        let image = service
            .upload_image(
                fixtures::jpeg(64, 64),
                "a.jpg",
                "image/jpeg",
                vec![OperationParams::new(OperationKind::Grayscale)],
            )
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let status = service.get_image_status(&image.id).await.unwrap();
                if status.status.is_terminal() {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(report.status, ImageStatus::Completed);

        cancel.cancel();
        let shutdown = run.await.unwrap();
        assert_eq!(shutdown.abandoned, 0);
    }
}
