//! Task orchestration: download, run the pipeline, persist each stage.
//!
//! One [`TaskOrchestrator`] is shared by every worker; it holds no per-task
//! state. Status and statistics writes are best effort: a failed write is
//! logged and never turns a processed task into a failed one.

pub mod retry;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::broker::TaskHandler;
use crate::config::WorkerConfig;
use crate::error::{StorageError, TaskError};
use crate::pipeline::{ImagePipeline, StageOutput};
use crate::stats::StatsService;
use crate::storage::{ImageRepository, ObjectStore};
use crate::types::{
    ImageStatus, JobUpdate, OperationKind, Parameters, ProcessedImage, ProcessingTask,
};

pub use retry::{backoff_duration, is_retryable};

/// Retry and status-reporting policy.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Attempts per task, including the first
    pub max_attempts: u32,
    /// Linear backoff unit: the wait after attempt `n` is `n * retry_backoff`
    pub retry_backoff: Duration,
    /// Stop retrying as soon as an attempt fails validation
    pub fail_fast_on_validation: bool,
    /// Write failed status and statistics on every failed attempt, not just the last
    pub record_intermediate_failures: bool,
    /// End the job `completed_with_warnings` when stages were skipped
    pub report_partial_success: bool,
}

impl OrchestratorOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            retry_backoff: config.retry_backoff(),
            fail_fast_on_validation: config.fail_fast_on_validation,
            record_intermediate_failures: config.record_intermediate_failures,
            report_partial_success: config.report_partial_success,
        }
    }
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// What a successful attempt persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    pub stored: Vec<OperationKind>,
    /// Stages whose artifact could not be stored, with the reason
    pub skipped: Vec<(OperationKind, String)>,
}

impl TaskOutcome {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Drives a [`ProcessingTask`] through download, pipeline and persistence.
pub struct TaskOrchestrator {
    pipeline: Arc<ImagePipeline>,
    objects: Arc<dyn ObjectStore>,
    images: Arc<dyn ImageRepository>,
    stats: Arc<StatsService>,
    options: OrchestratorOptions,
}

impl TaskOrchestrator {
    pub fn new(
        pipeline: Arc<ImagePipeline>,
        objects: Arc<dyn ObjectStore>,
        images: Arc<dyn ImageRepository>,
        stats: Arc<StatsService>,
        mut options: OrchestratorOptions,
    ) -> Self {
        options.max_attempts = options.max_attempts.max(1);
        Self {
            pipeline,
            objects,
            images,
            stats,
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Run one attempt of `task`.
    ///
    /// A download or pipeline failure ends the attempt and is returned. Failure
    /// side effects (failed job and image, failure statistics) are written
    /// unless intermediate failures are suppressed and this attempt is neither
    /// the last one nor a terminal failure.
    pub async fn process_task(
        &self,
        task: &ProcessingTask,
        attempt: u32,
        is_final: bool,
    ) -> Result<TaskOutcome, TaskError> {
        tracing::info!(
            task_id = %task.id,
            image_id = %task.image_id,
            attempt,
            operations = task.operations.len(),
            "Processing task"
        );

        if let Err(e) = self.images.record_job_attempt(&task.id, attempt).await {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to record job attempt");
        }
        self.set_image_status(&task.image_id, ImageStatus::Processing)
            .await;

        let original = match self.objects.download(&task.original_path).await {
            Ok(bytes) => bytes,
            Err(source) => {
                let err = TaskError::Download {
                    task_id: task.id.clone(),
                    image_id: task.image_id.clone(),
                    path: task.original_path.clone(),
                    source,
                };
                self.record_failure(task, &err, is_final).await;
                return Err(err);
            }
        };

        let outputs = match self
            .pipeline
            .process_image(original, &task.operations)
            .await
        {
            Ok(outputs) => outputs,
            Err(source) => {
                let err = TaskError::Pipeline {
                    task_id: task.id.clone(),
                    image_id: task.image_id.clone(),
                    source,
                };
                self.record_failure(task, &err, is_final).await;
                return Err(err);
            }
        };

        let mut outcome = TaskOutcome::default();
        for (kind, stage) in outputs {
            let started = Instant::now();
            match self.persist_stage(task, kind, &stage).await {
                Ok(()) => {
                    let duration = stage.duration + started.elapsed();
                    let duration_ms = duration.as_secs_f64() * 1000.0;
                    if let Err(e) = self.stats.record_processed(kind, duration_ms).await {
                        tracing::warn!(operation = %kind, error = %e, "Failed to record statistics");
                    }
                    outcome.stored.push(kind);
                }
                Err(reason) => {
                    tracing::warn!(
                        task_id = %task.id,
                        image_id = %task.image_id,
                        operation = %kind,
                        reason = %reason,
                        "Skipping stage"
                    );
                    outcome.skipped.push((kind, reason));
                }
            }
        }

        let update = if outcome.is_partial() && self.options.report_partial_success {
            JobUpdate::completed_with_warnings(
                outcome
                    .skipped
                    .iter()
                    .map(|(kind, reason)| format!("{kind}: {reason}"))
                    .collect(),
            )
        } else {
            JobUpdate::completed()
        };
        let status = update.status;
        if let Err(e) = self.images.update_job_status(&task.id, update).await {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to update job status");
        }
        self.set_image_status(&task.image_id, ImageStatus::Completed)
            .await;

        tracing::info!(
            task_id = %task.id,
            image_id = %task.image_id,
            stored = outcome.stored.len(),
            skipped = outcome.skipped.len(),
            job_status = %status,
            "Task completed"
        );
        Ok(outcome)
    }

    /// Run `task` until an attempt succeeds or the attempt budget is spent.
    ///
    /// Waits `attempt * retry_backoff` between attempts. The wait is not
    /// cancellable. With `fail_fast_on_validation`, a non-retryable failure
    /// ends the loop immediately. The returned error wraps the last attempt's.
    pub async fn process_task_with_retry(
        &self,
        task: &ProcessingTask,
    ) -> Result<TaskOutcome, TaskError> {
        let max_attempts = self.options.max_attempts;
        let mut attempt = 1;
        loop {
            let is_final = attempt >= max_attempts;
            let err = match self.process_task(task, attempt, is_final).await {
                Ok(outcome) => {
                    if attempt > 1 {
                        tracing::info!(task_id = %task.id, attempt, "Task succeeded after retry");
                    }
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            let retryable = is_retryable(&err);
            if is_final || (!retryable && self.options.fail_fast_on_validation) {
                tracing::error!(
                    task_id = %task.id,
                    image_id = %task.image_id,
                    attempts = attempt,
                    retryable,
                    error = %err,
                    "Task failed"
                );
                return Err(TaskError::RetriesExhausted {
                    task_id: task.id.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = backoff_duration(attempt, self.options.retry_backoff);
            tracing::warn!(
                task_id = %task.id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Task attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn persist_stage(
        &self,
        task: &ProcessingTask,
        kind: OperationKind,
        stage: &StageOutput,
    ) -> Result<(), String> {
        let path = format!(
            "processed/{}/{}/{}.{}",
            task.image_id,
            kind,
            Uuid::new_v4(),
            stage.format.extension()
        );
        let mime_type = stage.format.mime_type();
        self.objects
            .upload(&path, stage.bytes.clone(), mime_type)
            .await
            .map_err(|e| format!("upload failed: {e}"))?;

        let processed = ProcessedImage {
            id: Uuid::new_v4().to_string(),
            image_id: task.image_id.clone(),
            operation: kind,
            parameters: stage_parameters(task, kind),
            path: path.clone(),
            size: stage.bytes.len() as u64,
            mime_type: mime_type.to_string(),
            format: stage.format,
            status: ImageStatus::Completed,
            created_at: chrono::Utc::now(),
        };
        self.images
            .create_processed_image(&processed)
            .await
            .map_err(|e| format!("record failed: {e}"))?;

        tracing::debug!(operation = %kind, path = %path, size = processed.size, "Stage stored");
        Ok(())
    }

    async fn record_failure(&self, task: &ProcessingTask, err: &TaskError, is_final: bool) {
        let terminal = self.options.fail_fast_on_validation && !is_retryable(err);
        if !(self.options.record_intermediate_failures || is_final || terminal) {
            tracing::debug!(task_id = %task.id, "Deferring failure status to final attempt");
            return;
        }

        if let Err(e) = self
            .images
            .update_job_status(&task.id, JobUpdate::failed(err.to_string()))
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to mark job failed");
        }
        self.set_image_status(&task.image_id, ImageStatus::Failed)
            .await;

        for op in &task.operations {
            let recorded = match op.operation_kind() {
                Ok(kind) => self.stats.record_failed(kind, 0.0).await,
                Err(_) => self.stats.record_unclassified_failure().await,
            };
            if let Err(e) = recorded {
                tracing::warn!(operation = %op.kind, error = %e, "Failed to record failure");
            }
        }
    }

    async fn set_image_status(&self, image_id: &str, status: ImageStatus) {
        match self.images.update_image_status(image_id, status).await {
            Ok(()) => {}
            Err(StorageError::RecordNotFound { .. }) => {
                tracing::warn!(image_id, status = %status, "Image record missing");
            }
            Err(e) => {
                tracing::warn!(image_id, status = %status, error = %e, "Failed to update image status");
            }
        }
    }
}

/// Parameters of the stage whose output was kept for `kind`: the last one.
fn stage_parameters(task: &ProcessingTask, kind: OperationKind) -> Parameters {
    task.operations
        .iter()
        .rev()
        .find(|op| op.operation_kind().ok() == Some(kind))
        .map(|op| op.parameters.clone())
        .unwrap_or_default()
}

/// Consumer entry point.
///
/// A task whose last attempt failed validation is already recorded as failed
/// and would fail the same way on redelivery, so it is reported as handled and
/// its message committed. Retryable failures still surface as errors.
#[async_trait]
impl TaskHandler for TaskOrchestrator {
    async fn handle(&self, task: ProcessingTask) -> Result<(), TaskError> {
        match self.process_task_with_retry(&task).await {
            Ok(_) => Ok(()),
            Err(err) if !is_retryable(err.last_attempt()) => {
                tracing::warn!(
                    task_id = %task.id,
                    image_id = %task.image_id,
                    error = %err,
                    "Task failed permanently, committing"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
