//! The upstream image API: upload, fetch, status, delete, list.
//!
//! Uploads are synchronous up to the point the task is queued. Everything
//! after that is visible only through [`ImageService::get_image_status`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::broker::TaskProducer;
use crate::config::Config;
use crate::error::{ServiceError, StorageError};
use crate::pipeline::ImagePipeline;
use crate::stats::StatsService;
use crate::storage::{ImageRepository, ObjectStore};
use crate::types::{
    Image, ImageStatus, ImageStatusReport, OperationKind, OperationParams, Page, ProcessingJob,
    ProcessingTask,
};

/// Name under which callers address the unprocessed upload.
pub const ORIGINAL: &str = "original";

const MIB: u64 = 1024 * 1024;

pub struct ImageService {
    pipeline: Arc<ImagePipeline>,
    objects: Arc<dyn ObjectStore>,
    images: Arc<dyn ImageRepository>,
    stats: Arc<StatsService>,
    producer: Arc<TaskProducer>,
    bucket: String,
    max_upload_bytes: u64,
    url_expiry: Duration,
    max_attempts: u32,
}

impl ImageService {
    pub fn new(
        config: &Config,
        pipeline: Arc<ImagePipeline>,
        objects: Arc<dyn ObjectStore>,
        images: Arc<dyn ImageRepository>,
        stats: Arc<StatsService>,
        producer: Arc<TaskProducer>,
    ) -> Self {
        Self {
            pipeline,
            objects,
            images,
            stats,
            producer,
            bucket: config.storage.bucket.clone(),
            max_upload_bytes: config.storage.max_upload_bytes(),
            url_expiry: config.storage.presigned_url_expiry(),
            max_attempts: config.worker.retry_attempts,
        }
    }

    /// Store an upload and queue its operations.
    ///
    /// Fails only if the bytes or operations are rejected, or the original
    /// cannot be stored or recorded. A failed publish is logged and leaves the image
    /// `uploaded`. With no operations the image is `completed` at once.
    pub async fn upload_image(
        &self,
        data: Vec<u8>,
        filename: &str,
        mime_type: &str,
        operations: Vec<OperationParams>,
    ) -> Result<Image, ServiceError> {
        let size = data.len() as u64;
        if size > self.max_upload_bytes {
            return Err(ServiceError::FileTooLarge {
                size_mb: size.div_ceil(MIB),
                max_mb: self.max_upload_bytes / MIB,
            });
        }
        let info = self.pipeline.validate_image(&data)?;
        self.pipeline
            .validate_operations(&operations)
            .map_err(ServiceError::InvalidOperation)?;
        let detected_mime = info.format.mime_type();
        if !mime_type.eq_ignore_ascii_case(detected_mime) {
            tracing::debug!(
                filename,
                declared = mime_type,
                detected = detected_mime,
                "Declared content type differs from image data"
            );
        }

        let id = Uuid::new_v4().to_string();
        let storage_path = format!("originals/{id}.{}", info.format.extension());
        self.objects
            .upload(&storage_path, data, detected_mime)
            .await?;

        let now = chrono::Utc::now();
        let mut image = Image {
            id: id.clone(),
            original_name: filename.to_string(),
            size,
            mime_type: detected_mime.to_string(),
            storage_path: storage_path.clone(),
            bucket: self.bucket.clone(),
            width: info.width,
            height: info.height,
            format: info.format,
            status: ImageStatus::Uploaded,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.images.create_image(&image).await {
            if let Err(cleanup) = self.objects.delete(&storage_path).await {
                tracing::warn!(path = %storage_path, error = %cleanup, "Failed to remove orphaned original");
            }
            return Err(e.into());
        }
        if let Err(e) = self.stats.record_uploaded(size).await {
            tracing::warn!(image_id = %id, error = %e, "Failed to record upload");
        }
        tracing::info!(
            image_id = %id,
            filename,
            size,
            width = info.width,
            height = info.height,
            operations = operations.len(),
            "Image uploaded"
        );

        if operations.is_empty() {
            self.images
                .update_image_status(&id, ImageStatus::Completed)
                .await?;
            image.status = ImageStatus::Completed;
            return Ok(image);
        }

        let task = ProcessingTask {
            id: Uuid::new_v4().to_string(),
            image_id: id.clone(),
            original_path: storage_path,
            bucket: self.bucket.clone(),
            operations,
            format: info.format,
        };
        if let Err(e) = self
            .images
            .create_job(&ProcessingJob::pending(&task, self.max_attempts))
            .await
        {
            tracing::warn!(image_id = %id, task_id = %task.id, error = %e, "Failed to create job record");
        }

        // Mark processing before publishing so a fast worker's final status
        // is never overwritten.
        self.images
            .update_image_status(&id, ImageStatus::Processing)
            .await?;
        match self.producer.publish_task(&task).await {
            Ok(()) => image.status = ImageStatus::Processing,
            Err(e) => {
                tracing::warn!(
                    image_id = %id,
                    task_id = %task.id,
                    error = %e,
                    "Failed to queue processing task, image left uploaded"
                );
                self.images
                    .update_image_status(&id, ImageStatus::Uploaded)
                    .await?;
            }
        }
        Ok(image)
    }

    /// Bytes and mime type of the original or of the latest artifact of a kind.
    pub async fn get_image(
        &self,
        image_id: &str,
        operation: &str,
    ) -> Result<(Vec<u8>, String), ServiceError> {
        let (path, mime_type) = self.resolve(image_id, operation).await?;
        let bytes = self.objects.download(&path).await?;
        Ok((bytes, mime_type))
    }

    /// A time-limited URL for the original or an artifact.
    pub async fn get_image_url(
        &self,
        image_id: &str,
        operation: &str,
    ) -> Result<String, ServiceError> {
        let (path, _) = self.resolve(image_id, operation).await?;
        Ok(self.objects.presigned_url(&path, self.url_expiry).await?)
    }

    /// Status and progress: distinct stored kinds over distinct requested kinds.
    pub async fn get_image_status(&self, image_id: &str) -> Result<ImageStatusReport, ServiceError> {
        let image = self.images.get_image(image_id).await?;
        let processed: BTreeSet<OperationKind> = self
            .images
            .list_processed_images(image_id)
            .await?
            .into_iter()
            .map(|p| p.operation)
            .collect();
        let requested: BTreeSet<String> = self
            .images
            .latest_job_for_image(image_id)
            .await?
            .map(|job| {
                job.operations
                    .iter()
                    .map(|op| op.kind.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let total = requested.len();
        let done = processed.len().min(total);
        let progress = if image.status == ImageStatus::Completed {
            100
        } else if total == 0 {
            0
        } else {
            (done * 100 / total) as u8
        };

        Ok(ImageStatusReport {
            image_id: image.id,
            status: image.status,
            progress,
            processed_operations: done,
            total_operations: total,
            created_at: image.created_at,
            updated_at: image.updated_at,
        })
    }

    /// Remove the original, every artifact, and all rows for the image.
    pub async fn delete_image(&self, image_id: &str) -> Result<(), ServiceError> {
        let image = self.images.get_image(image_id).await?;
        let mut keys = vec![image.storage_path];
        keys.extend(
            self.images
                .list_processed_images(image_id)
                .await?
                .into_iter()
                .map(|p| p.path),
        );
        self.objects.delete_many(&keys).await?;
        self.images.delete_image(image_id).await?;
        tracing::info!(image_id, objects = keys.len(), "Image deleted");
        Ok(())
    }

    /// Newest first.
    pub async fn list_images(&self, limit: usize, offset: usize) -> Result<Page<Image>, ServiceError> {
        Ok(self.images.list_images(limit, offset).await?)
    }

    async fn resolve(
        &self,
        image_id: &str,
        operation: &str,
    ) -> Result<(String, String), ServiceError> {
        let image = self.images.get_image(image_id).await?;
        if operation.eq_ignore_ascii_case(ORIGINAL) {
            return Ok((image.storage_path, image.mime_type));
        }
        let kind: OperationKind = operation
            .parse()
            .map_err(|_| ServiceError::UnknownOperation(operation.to_string()))?;
        match self.images.get_processed_image(image_id, kind).await {
            Ok(processed) => Ok((processed.path, processed.mime_type)),
            Err(StorageError::RecordNotFound { .. }) => Err(ServiceError::ProcessedNotFound {
                image_id: image_id.to_string(),
                operation: kind.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
