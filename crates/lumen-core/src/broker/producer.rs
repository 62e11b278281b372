//! Publishes processing tasks keyed by image id.

use std::sync::Arc;

use super::{Broker, Header, OutgoingMessage};
use crate::error::BrokerError;
use crate::types::ProcessingTask;

pub const TASK_ID_HEADER: &str = "task-id";
pub const IMAGE_ID_HEADER: &str = "image-id";

/// Serializes tasks as JSON and hands them to the broker.
///
/// Publishing is not retried here; callers decide whether a failed publish
/// matters to them.
pub struct TaskProducer {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl TaskProducer {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn encode(task: &ProcessingTask) -> Result<OutgoingMessage, BrokerError> {
        Ok(OutgoingMessage {
            key: task.image_id.clone(),
            payload: serde_json::to_vec(task)?,
            headers: vec![
                Header::new(TASK_ID_HEADER, task.id.as_str()),
                Header::new(IMAGE_ID_HEADER, task.image_id.as_str()),
            ],
        })
    }

    pub async fn publish_task(&self, task: &ProcessingTask) -> Result<(), BrokerError> {
        let message = Self::encode(task)?;
        self.broker.publish(&self.topic, message).await?;
        tracing::info!(
            task_id = %task.id,
            image_id = %task.image_id,
            operations = task.operations.len(),
            "Task published"
        );
        Ok(())
    }

    /// Publish several tasks in one broker call.
    ///
    /// Tasks that fail to serialize are logged and left out; the rest are
    /// published together. Returns the number of tasks published.
    pub async fn publish_batch(&self, tasks: &[ProcessingTask]) -> Result<usize, BrokerError> {
        let messages: Vec<OutgoingMessage> = tasks
            .iter()
            .filter_map(|task| match Self::encode(task) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to serialize task");
                    None
                }
            })
            .collect();
        let count = messages.len();
        if count == 0 {
            return Ok(0);
        }
        self.broker.publish_batch(&self.topic, messages).await?;
        tracing::info!(count, "Task batch published");
        Ok(count)
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.broker.close().await
    }
}
