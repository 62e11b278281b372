//! Fetch-handle-commit loop over a [`MessageSource`].
//!
//! A message is committed if and only if its handler returns `Ok`. Malformed
//! payloads and handler failures are left uncommitted for redelivery.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{ConsumerStats, Message, MessageSource};
use crate::error::{BrokerError, TaskError};
use crate::types::ProcessingTask;

/// Pause after a fetch error before fetching again.
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where a consumer loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Fetching,
    Handling,
    Committing,
    Stopped,
}

/// Something that processes one task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: ProcessingTask) -> Result<(), TaskError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(ProcessingTask) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn handle(&self, task: ProcessingTask) -> Result<(), TaskError> {
        self(task).await
    }
}

/// A decoded task together with the message it came from.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub task: ProcessingTask,
    pub message: Message,
}

/// Consumes processing tasks. One instance is shared by every worker.
pub struct TaskConsumer {
    source: Arc<dyn MessageSource>,
    batch_fetch_timeout: Duration,
    handling: AtomicUsize,
}

fn enter(state: ConsumerState) {
    tracing::trace!(state = ?state, "Consumer state");
}

impl TaskConsumer {
    pub fn new(source: Arc<dyn MessageSource>, batch_fetch_timeout: Duration) -> Self {
        Self {
            source,
            batch_fetch_timeout,
            handling: AtomicUsize::new(0),
        }
    }

    /// Handlers currently running across all loops.
    pub fn handling(&self) -> usize {
        self.handling.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.source.stats()
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.source.close().await
    }

    /// Run the consumer loop until `cancel` fires.
    ///
    /// Returns `Ok` on cancellation and `Err(Closed)` if the source is closed
    /// underneath the loop. Other fetch errors are logged and retried.
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        handler: &dyn TaskHandler,
    ) -> Result<(), BrokerError> {
        loop {
            if cancel.is_cancelled() {
                enter(ConsumerState::Stopped);
                return Ok(());
            }

            enter(ConsumerState::Fetching);
            let message = match self.source.fetch(cancel).await {
                Ok(message) => message,
                Err(BrokerError::Cancelled) => {
                    enter(ConsumerState::Stopped);
                    return Ok(());
                }
                Err(BrokerError::Closed) => {
                    enter(ConsumerState::Stopped);
                    return Err(BrokerError::Closed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to fetch message, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                    }
                    continue;
                }
            };

            enter(ConsumerState::Handling);
            let task: ProcessingTask = match serde_json::from_slice(&message.payload) {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Failed to deserialize task, leaving message uncommitted"
                    );
                    enter(ConsumerState::Idle);
                    continue;
                }
            };
            let task_id = task.id.clone();

            self.handling.fetch_add(1, Ordering::Relaxed);
            let result = handler.handle(task).await;
            self.handling.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(()) => {
                    enter(ConsumerState::Committing);
                    match self.source.commit(&message).await {
                        Ok(()) => tracing::debug!(
                            task_id = %task_id,
                            partition = message.partition,
                            offset = message.offset,
                            "Message committed"
                        ),
                        Err(e) => tracing::error!(
                            task_id = %task_id,
                            offset = message.offset,
                            error = %e,
                            "Failed to commit message"
                        ),
                    }
                }
                Err(e) => {
                    tracing::error!(
                        task_id = %task_id,
                        offset = message.offset,
                        error = %e,
                        "Task handler failed, message left for redelivery"
                    );
                }
            }
            enter(ConsumerState::Idle);
        }
    }

    /// Fetch up to `max` tasks, giving each fetch `batch_fetch_timeout`.
    ///
    /// Stops early as soon as a fetch finds nothing. Items must be committed
    /// with [`commit`](Self::commit) once handled.
    pub async fn read_batch(
        &self,
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchItem>, BrokerError> {
        let mut items = Vec::with_capacity(max);
        while items.len() < max {
            let message = match timeout(self.batch_fetch_timeout, self.source.fetch(cancel)).await
            {
                Err(_) | Ok(Err(BrokerError::Cancelled)) => break,
                Ok(Err(e)) if items.is_empty() => return Err(e),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Fetch failed, returning partial batch");
                    break;
                }
                Ok(Ok(message)) => message,
            };
            match serde_json::from_slice::<ProcessingTask>(&message.payload) {
                Ok(task) => items.push(BatchItem { task, message }),
                Err(e) => tracing::error!(
                    offset = message.offset,
                    error = %e,
                    "Failed to deserialize task in batch, skipping"
                ),
            }
        }
        tracing::debug!(count = items.len(), "Batch read");
        Ok(items)
    }

    pub async fn commit(&self, item: &BatchItem) -> Result<(), BrokerError> {
        self.source.commit(&item.message).await
    }
}
