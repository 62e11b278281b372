//! Capability interfaces for object storage and relational metadata.
//!
//! Every trait object is shared across all workers, so implementations must
//! be safe for concurrent use. The in-memory implementations in [`memory`]
//! back the standalone binary and the tests.

pub mod memory;

use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::error::StorageError;
use crate::types::{
    Image, ImageStatus, JobUpdate, OperationKind, OperationStatistics, Page, ProcessedImage,
    ProcessingJob, Statistics,
};

pub use memory::{MemoryImageRepository, MemoryObjectStore, MemoryStatsRepository};

/// A readable object body.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Blob storage keyed by path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any existing object.
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: &str)
        -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn download_stream(&self, key: &str) -> Result<ByteStream, StorageError>;

    /// Remove an object. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// A time-limited download URL for an existing object.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Image, processed-artifact and job rows.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn create_image(&self, image: &Image) -> Result<(), StorageError>;

    async fn get_image(&self, id: &str) -> Result<Image, StorageError>;

    async fn update_image_status(&self, id: &str, status: ImageStatus)
        -> Result<(), StorageError>;

    /// Newest first.
    async fn list_images(&self, limit: usize, offset: usize) -> Result<Page<Image>, StorageError>;

    /// Remove the image row together with its processed rows and jobs.
    async fn delete_image(&self, id: &str) -> Result<(), StorageError>;

    async fn create_processed_image(&self, processed: &ProcessedImage)
        -> Result<(), StorageError>;

    async fn list_processed_images(&self, image_id: &str)
        -> Result<Vec<ProcessedImage>, StorageError>;

    /// The most recent artifact of `kind` for an image.
    async fn get_processed_image(
        &self,
        image_id: &str,
        kind: OperationKind,
    ) -> Result<ProcessedImage, StorageError>;

    async fn create_job(&self, job: &ProcessingJob) -> Result<(), StorageError>;

    async fn get_job(&self, id: &str) -> Result<ProcessingJob, StorageError>;

    async fn latest_job_for_image(&self, image_id: &str)
        -> Result<Option<ProcessingJob>, StorageError>;

    /// Mark the job processing and record which attempt is running.
    async fn record_job_attempt(&self, id: &str, attempt: u32) -> Result<(), StorageError>;

    async fn update_job_status(&self, id: &str, update: JobUpdate) -> Result<(), StorageError>;
}

/// Aggregate and per-operation counters.
#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn increment_uploaded(&self, size: u64) -> Result<(), StorageError>;

    async fn increment_processed(&self, duration_ms: f64) -> Result<(), StorageError>;

    async fn increment_failed(&self) -> Result<(), StorageError>;

    async fn update_operation_statistics(
        &self,
        kind: OperationKind,
        success: bool,
        duration_ms: f64,
    ) -> Result<(), StorageError>;

    async fn get_statistics(&self) -> Result<Statistics, StorageError>;

    async fn get_operation_statistics(&self) -> Result<Vec<OperationStatistics>, StorageError>;

    /// The kind with the most recorded events, if any were recorded.
    async fn get_most_used_operation(&self) -> Result<Option<OperationKind>, StorageError>;
}
