//! Error types for the Lumen processing pipeline.
//!
//! Errors are organized by concern (pipeline, storage, broker, task, service)
//! so each layer can wrap the one below it with the context it knows about:
//! which stage, which task, which image.

use thiserror::Error;

use crate::types::{ImageFormat, OperationKind};

/// Top-level error type for Lumen operations.
#[derive(Error, Debug)]
pub enum LumenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Image pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Object or relational storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Message broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Task orchestration errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Upstream service errors
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Image pipeline errors.
///
/// `EmptyInput`, `UnsupportedFormat`, `ImageTooLarge`, `UnknownOperation`,
/// `InvalidParameters`, `Decode` and `Rejected` are validation failures:
/// retrying the same input can never succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// No bytes were supplied
    #[error("Empty image data")]
    EmptyInput,

    /// Input is not one of the supported formats
    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: String },

    /// Image dimensions exceed the configured limit
    #[error("Image too large: {width}x{height} > {max_dim}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        max_dim: u32,
    },

    /// Operation name does not map to a registered operation
    #[error("Unknown operation type: {kind}")]
    UnknownOperation { kind: String },

    /// Operation parameters failed validation
    #[error("Invalid parameters for operation {kind}: {message}")]
    InvalidParameters {
        kind: OperationKind,
        message: String,
    },

    /// A stage failed while executing
    #[error("Stage {stage} ({kind}) failed: {message}")]
    Execute {
        stage: usize,
        kind: OperationKind,
        message: String,
    },

    /// A stage found its input unusable, e.g. undecodable pixel data
    #[error("Stage {stage} ({kind}) rejected its input: {source}")]
    Rejected {
        stage: usize,
        kind: OperationKind,
        source: Box<PipelineError>,
    },

    /// A stage exceeded the per-stage timeout
    #[error("Timeout in stage {stage} ({kind}) after {timeout_ms}ms")]
    Timeout {
        stage: usize,
        kind: OperationKind,
        timeout_ms: u64,
    },

    /// Pixel data could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Pixel data could not be encoded
    #[error("Failed to encode {format}: {message}")]
    Encode {
        format: ImageFormat,
        message: String,
    },
}

impl PipelineError {
    /// Whether this error comes from validating the input rather than running it.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyInput
                | Self::UnsupportedFormat { .. }
                | Self::ImageTooLarge { .. }
                | Self::UnknownOperation { .. }
                | Self::InvalidParameters { .. }
                | Self::Decode { .. }
                | Self::Rejected { .. }
        )
    }
}

/// Object-store and relational-store errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// No object under the given key
    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    /// No row with the given id
    #[error("{entity} not found: {id}")]
    RecordNotFound { entity: &'static str, id: String },

    /// Transport or backend failure
    #[error("Storage I/O error: {message}")]
    Io { message: String },
}

/// Message broker errors.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection has been closed
    #[error("Broker connection closed")]
    Closed,

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to hand a message to the broker
    #[error("Failed to publish message: {message}")]
    Publish { message: String },

    /// Failed to commit a consumed offset
    #[error("Failed to commit offset {offset}: {message}")]
    Commit { offset: u64, message: String },

    /// Fetch failed for a reason other than cancellation
    #[error("Failed to fetch message: {message}")]
    Fetch { message: String },

    /// Topic provisioning failed
    #[error("Invalid topic configuration for {topic}: {message}")]
    Topic { topic: String, message: String },
}

/// Errors surfaced by the task orchestrator.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The original image could not be downloaded
    #[error("Failed to download original image {path} for task {task_id}: {source}")]
    Download {
        task_id: String,
        image_id: String,
        path: String,
        #[source]
        source: StorageError,
    },

    /// The operation chain failed
    #[error("Failed to process image {image_id} for task {task_id}: {source}")]
    Pipeline {
        task_id: String,
        image_id: String,
        #[source]
        source: PipelineError,
    },

    /// Every permitted attempt failed; wraps the last attempt's error
    #[error("Task {task_id} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        task_id: String,
        attempts: u32,
        #[source]
        source: Box<TaskError>,
    },
}

impl TaskError {
    /// Id of the task this error belongs to.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Download { task_id, .. }
            | Self::Pipeline { task_id, .. }
            | Self::RetriesExhausted { task_id, .. } => task_id,
        }
    }

    /// The innermost per-attempt error, unwrapping retry exhaustion.
    pub fn last_attempt(&self) -> &TaskError {
        match self {
            Self::RetriesExhausted { source, .. } => source.last_attempt(),
            other => other,
        }
    }
}

/// Errors from the upstream service boundary.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Storage failed while serving the request
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Uploaded bytes are not a processable image
    #[error("Invalid image: {0}")]
    InvalidImage(#[from] PipelineError),

    /// A requested operation is unknown or has invalid parameters
    #[error("Invalid operation: {0}")]
    InvalidOperation(PipelineError),

    /// Upload exceeds the configured size limit
    #[error("File too large: {size_mb}MB > {max_mb}MB")]
    FileTooLarge { size_mb: u64, max_mb: u64 },

    /// Requested operation name is neither "original" nor a known kind
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// No artifact exists for the requested operation
    #[error("No processed image for {image_id} ({operation})")]
    ProcessedNotFound { image_id: String, operation: String },
}

/// Convenience type alias for Lumen results.
pub type Result<T> = std::result::Result<T, LumenError>;

/// Convenience type alias for pipeline-specific results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
