//! Fixed-size pool of consumer loops sharing one root cancellation token.

use futures_util::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::broker::{TaskConsumer, TaskHandler};
use crate::config::WorkerConfig;
use crate::error::BrokerError;

/// How many workers stopped within the shutdown timeout.
///
/// A worker that panicked counts as abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub clean: usize,
    pub abandoned: usize,
}

/// Runs `num_workers` copies of the consumer loop over one shared consumer.
pub struct WorkerPool {
    consumer: Arc<TaskConsumer>,
    handler: Arc<dyn TaskHandler>,
    num_workers: usize,
    stats_interval: Duration,
    shutdown_timeout: Duration,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(consumer: Arc<TaskConsumer>, handler: Arc<dyn TaskHandler>, num_workers: usize) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            consumer,
            handler,
            num_workers: num_workers.max(1),
            stats_interval: defaults.stats_interval(),
            shutdown_timeout: defaults.shutdown_timeout(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(
        consumer: Arc<TaskConsumer>,
        handler: Arc<dyn TaskHandler>,
        config: &WorkerConfig,
    ) -> Self {
        Self::new(consumer, handler, config.num_workers)
            .with_stats_interval(config.stats_interval())
            .with_shutdown_timeout(config.shutdown_timeout())
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The root token. Cancelling it starts shutdown just like `shutdown` resolving.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until `shutdown` resolves or the root token is cancelled, then drain.
    ///
    /// In-flight handlers are not interrupted. Workers still running when the
    /// shutdown timeout elapses are abandoned and counted in the report.
    pub async fn run<F>(self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tracing::info!(workers = self.num_workers, "Starting worker pool");

        let finished = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(self.num_workers);
        for id in 0..self.num_workers {
            let consumer = Arc::clone(&self.consumer);
            let handler = Arc::clone(&self.handler);
            let cancel = self.cancel.clone();
            let finished = Arc::clone(&finished);
            workers.push(tokio::spawn(async move {
                tracing::debug!(worker = id, "Worker started");
                match consumer.start(&cancel, handler.as_ref()).await {
                    Ok(()) => tracing::debug!(worker = id, "Worker stopped"),
                    Err(BrokerError::Closed) => {
                        tracing::warn!(worker = id, "Consumer closed, worker exiting")
                    }
                    Err(e) => tracing::error!(worker = id, error = %e, "Worker failed"),
                }
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let monitor = tokio::spawn(monitor_stats(
            Arc::clone(&self.consumer),
            self.stats_interval,
            self.cancel.clone(),
        ));

        tokio::select! {
            _ = shutdown => tracing::info!("Shutdown signal received"),
            _ = self.cancel.cancelled() => tracing::info!("Worker pool cancelled"),
        }
        self.cancel.cancel();

        let report = match tokio::time::timeout(self.shutdown_timeout, join_all(workers)).await {
            Ok(results) => {
                let mut clean = 0;
                for result in &results {
                    match result {
                        Ok(()) => clean += 1,
                        Err(e) => tracing::error!(error = %e, "Worker task panicked"),
                    }
                }
                ShutdownReport {
                    clean,
                    abandoned: self.num_workers - clean,
                }
            }
            Err(_) => {
                let clean = finished.load(Ordering::SeqCst);
                tracing::warn!(
                    clean,
                    abandoned = self.num_workers - clean,
                    timeout_secs = self.shutdown_timeout.as_secs_f64(),
                    "Shutdown timeout exceeded, forcing exit"
                );
                ShutdownReport {
                    clean,
                    abandoned: self.num_workers - clean,
                }
            }
        };

        if let Err(e) = monitor.await {
            tracing::debug!(error = %e, "Stats monitor ended abnormally");
        }
        if let Err(e) = self.consumer.close().await {
            tracing::warn!(error = %e, "Failed to close consumer");
        }
        tracing::info!(clean = report.clean, abandoned = report.abandoned, "Worker pool stopped");
        report
    }
}

async fn monitor_stats(consumer: Arc<TaskConsumer>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let stats = consumer.stats();
                tracing::info!(
                    messages = stats.messages,
                    bytes = stats.bytes,
                    lag = stats.lag,
                    in_flight = consumer.handling(),
                    "Consumer stats"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, TaskProducer};
    use crate::error::TaskError;
    use crate::types::{ImageFormat, ProcessingTask};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn task(n: u32) -> ProcessingTask {
        ProcessingTask {
            id: format!("t{n}"),
            image_id: format!("img-{n}"),
            original_path: format!("originals/img-{n}.jpg"),
            bucket: "images".into(),
            operations: vec![],
            format: ImageFormat::Jpeg,
        }
    }

    fn consumer(broker: &MemoryBroker) -> Arc<TaskConsumer> {
        Arc::new(TaskConsumer::new(
            Arc::new(broker.subscribe("tasks", "workers")),
            Duration::from_millis(10),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_processes_tasks_and_drains_cleanly() {
        let broker = MemoryBroker::new(4, Duration::from_secs(30));
        let consumer = consumer(&broker);
        let producer = TaskProducer::new(Arc::new(broker.clone()), "tasks");
        let tasks: Vec<_> = (0..8).map(task).collect();
        producer.publish_batch(&tasks).await.unwrap();

        let handled = Arc::new(AtomicU32::new(0));
        let done = Arc::new(Notify::new());
        let handler = {
            let handled = Arc::clone(&handled);
            let done = Arc::clone(&done);
            move |_task: ProcessingTask| {
                let handled = Arc::clone(&handled);
                let done = Arc::clone(&done);
                async move {
                    if handled.fetch_add(1, Ordering::SeqCst) + 1 == 8 {
                        done.notify_one();
                    }
                    Ok::<(), TaskError>(())
                }
            }
        };

        let pool = WorkerPool::new(consumer.clone(), Arc::new(handler), 3)
            .with_stats_interval(Duration::from_millis(5))
            .with_shutdown_timeout(Duration::from_secs(5));
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            pool.run(async move { done.notified().await }),
        )
        .await
        .unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 8);
        assert_eq!(
            report,
            ShutdownReport {
                clean: 3,
                abandoned: 0
            }
        );
        assert_eq!(consumer.stats().lag, 0);
    }

    #[tokio::test]
    async fn test_cancel_token_stops_idle_pool() {
        let broker = MemoryBroker::new(1, Duration::from_secs(30));
        let handler = |_task: ProcessingTask| async { Ok::<(), TaskError>(()) };
        let pool = WorkerPool::new(consumer(&broker), Arc::new(handler), 2);
        let cancel = pool.cancel_token();

        let run = tokio::spawn(pool.run(std::future::pending()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.clean, 2);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_abandons_busy_worker() {
        let broker = MemoryBroker::new(1, Duration::from_secs(30));
        TaskProducer::new(Arc::new(broker.clone()), "tasks")
            .publish_task(&task(1))
            .await
            .unwrap();

        let started = Arc::new(Notify::new());
        let handler = {
            let started = Arc::clone(&started);
            move |_task: ProcessingTask| {
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<(), TaskError>(())
                }
            }
        };

        let pool = WorkerPool::new(consumer(&broker), Arc::new(handler), 2)
            .with_shutdown_timeout(Duration::from_millis(50));
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            pool.run(async move { started.notified().await }),
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            ShutdownReport {
                clean: 1,
                abandoned: 1
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicked_worker_is_not_counted_clean() {
        let broker = MemoryBroker::new(1, Duration::from_secs(30));
        TaskProducer::new(Arc::new(broker.clone()), "tasks")
            .publish_task(&task(1))
            .await
            .unwrap();

        let started = Arc::new(Notify::new());
        let handler = {
            let started = Arc::clone(&started);
            move |task: ProcessingTask| {
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    if task.id == "t1" {
                        panic!("handler blew up on {}", task.id);
                    }
                    Ok::<(), TaskError>(())
                }
            }
        };

        let pool = WorkerPool::new(consumer(&broker), Arc::new(handler), 2)
            .with_shutdown_timeout(Duration::from_secs(5));
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            pool.run(async move {
                started.notified().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            ShutdownReport {
                clean: 1,
                abandoned: 1
            }
        );
    }
}
