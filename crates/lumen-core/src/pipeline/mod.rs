//! Sequential image-operation pipeline.
//!
//! Stages are chained: the bytes produced by stage *i* are the input of stage
//! *i + 1*. Every stage's output is kept so each operation kind can be stored
//! as its own artifact. Any stage failure aborts the whole call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::config::Config;
use crate::error::PipelineError;
use crate::operations::{codec, OperationRegistry};
use crate::types::{ImageFormat, ImageInfo, OperationKind, OperationParams, Parameters};

/// The output of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    /// Wall-clock time spent in the stage
    pub duration: Duration,
}

/// Stage outputs keyed by operation kind.
///
/// When a kind appears more than once in a chain, the later stage's output
/// replaces the earlier one here; chaining still runs every stage.
pub type PipelineOutput = BTreeMap<OperationKind, StageOutput>;

/// Runs operation chains against image bytes.
pub struct ImagePipeline {
    registry: Arc<OperationRegistry>,
    stage_timeout: Duration,
    max_dimension: u32,
}

impl ImagePipeline {
    pub fn new(config: &Config) -> Self {
        Self::with_registry(
            Arc::new(OperationRegistry::new(&config.processing)),
            config.worker.stage_timeout(),
            config.processing.max_image_dimension,
        )
    }

    pub fn with_registry(
        registry: Arc<OperationRegistry>,
        stage_timeout: Duration,
        max_dimension: u32,
    ) -> Self {
        Self {
            registry,
            stage_timeout,
            max_dimension,
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Read format and dimensions from the image header.
    pub fn image_info(&self, bytes: &[u8]) -> Result<ImageInfo, PipelineError> {
        codec::inspect(bytes)
    }

    /// Check the input is a supported image within the dimension limit.
    pub fn validate_image(&self, bytes: &[u8]) -> Result<ImageInfo, PipelineError> {
        let info = codec::inspect(bytes)?;
        if info.width > self.max_dimension || info.height > self.max_dimension {
            return Err(PipelineError::ImageTooLarge {
                width: info.width,
                height: info.height,
                max_dim: self.max_dimension,
            });
        }
        Ok(info)
    }

    /// Check every operation's kind and parameters without running it.
    pub fn validate_operations(&self, operations: &[OperationParams]) -> Result<(), PipelineError> {
        for op in operations {
            self.registry.get(op.operation_kind()?).validate(&op.parameters)?;
        }
        Ok(())
    }

    /// Apply `operations` in order.
    ///
    /// An empty chain returns an empty mapping once the input has validated.
    pub async fn process_image(
        &self,
        bytes: Vec<u8>,
        operations: &[OperationParams],
    ) -> Result<PipelineOutput, PipelineError> {
        let info = self.validate_image(&bytes)?;
        let mut outputs = PipelineOutput::new();
        let mut current = bytes;

        for (stage, op) in operations.iter().enumerate() {
            let kind = op.operation_kind()?;
            self.registry.get(kind).validate(&op.parameters)?;

            let started = Instant::now();
            let output = self
                .run_stage(stage, kind, current, op.parameters.clone())
                .await?;
            let duration = started.elapsed();

            tracing::debug!(
                stage,
                operation = %kind,
                bytes = output.len(),
                duration_ms = duration.as_millis() as u64,
                "Stage complete"
            );

            outputs.insert(
                kind,
                StageOutput {
                    bytes: output.clone(),
                    format: info.format,
                    duration,
                },
            );
            current = output;
        }

        Ok(outputs)
    }

    async fn run_stage(
        &self,
        stage: usize,
        kind: OperationKind,
        input: Vec<u8>,
        params: Parameters,
    ) -> Result<Vec<u8>, PipelineError> {
        let registry = Arc::clone(&self.registry);
        let result = timeout(
            self.stage_timeout,
            tokio::task::spawn_blocking(move || registry.get(kind).execute(&input, &params)),
        )
        .await;

        match result {
            Ok(Ok(Ok(bytes))) => Ok(bytes),
            Ok(Ok(Err(e))) if e.is_validation() => Err(PipelineError::Rejected {
                stage,
                kind,
                source: Box::new(e),
            }),
            Ok(Ok(Err(e))) => Err(PipelineError::Execute {
                stage,
                kind,
                message: e.to_string(),
            }),
            Ok(Err(e)) => Err(PipelineError::Execute {
                stage,
                kind,
                message: format!("Task join error: {}", e),
            }),
            Err(_) => Err(PipelineError::Timeout {
                stage,
                kind,
                timeout_ms: self.stage_timeout.as_millis() as u64,
            }),
        }
    }
}
