//! In-process implementations of the storage capabilities.
//!
//! State sits behind a `std::sync::Mutex` held only for the duration of each
//! call, never across an await. Counter updates are read-modify-write under
//! the same lock, so concurrent increments are never lost.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ByteStream, ImageRepository, ObjectStore, StatsRepository};
use crate::error::StorageError;
use crate::types::{
    Image, ImageStatus, JobUpdate, OperationKind, OperationStatistics, Page, ProcessedImage,
    ProcessingJob, Statistics,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(entity: &'static str, id: &str) -> StorageError {
    StorageError::RecordNotFound {
        entity,
        id: id.to_string(),
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Object store backed by a hash map.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Stored keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        lock(&self.objects)
            .get(key)
            .map(|object| object.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        tracing::trace!(key, size = data.len(), content_type, "Storing object");
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        lock(&self.objects)
            .get(key)
            .map(|object| object.data.clone())
            .ok_or_else(|| StorageError::ObjectNotFound {
                key: key.to_string(),
            })
    }

    async fn download_stream(&self, key: &str) -> Result<ByteStream, StorageError> {
        let data = self.download(key).await?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.objects).remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut objects = lock(&self.objects);
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(lock(&self.objects).contains_key(key))
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.exists(key).await? {
            return Err(StorageError::ObjectNotFound {
                key: key.to_string(),
            });
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("memory://{}/{}?expires={}", self.bucket, key, expires))
    }
}

#[derive(Debug, Default)]
struct Tables {
    images: Vec<Image>,
    processed: Vec<ProcessedImage>,
    jobs: Vec<ProcessingJob>,
}

/// Relational metadata held in insertion-ordered vectors.
#[derive(Debug, Default)]
pub struct MemoryImageRepository {
    tables: Mutex<Tables>,
}

impl MemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageRepository for MemoryImageRepository {
    async fn create_image(&self, image: &Image) -> Result<(), StorageError> {
        lock(&self.tables).images.push(image.clone());
        Ok(())
    }

    async fn get_image(&self, id: &str) -> Result<Image, StorageError> {
        lock(&self.tables)
            .images
            .iter()
            .find(|image| image.id == id)
            .cloned()
            .ok_or_else(|| not_found("image", id))
    }

    async fn update_image_status(
        &self,
        id: &str,
        status: ImageStatus,
    ) -> Result<(), StorageError> {
        let mut tables = lock(&self.tables);
        let image = tables
            .images
            .iter_mut()
            .find(|image| image.id == id)
            .ok_or_else(|| not_found("image", id))?;
        image.status = status;
        image.updated_at = Utc::now();
        Ok(())
    }

    async fn list_images(&self, limit: usize, offset: usize) -> Result<Page<Image>, StorageError> {
        let tables = lock(&self.tables);
        let items = tables
            .images
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(Page {
            items,
            total: tables.images.len(),
            limit,
            offset,
        })
    }

    async fn delete_image(&self, id: &str) -> Result<(), StorageError> {
        let mut tables = lock(&self.tables);
        let before = tables.images.len();
        tables.images.retain(|image| image.id != id);
        if tables.images.len() == before {
            return Err(not_found("image", id));
        }
        tables.processed.retain(|p| p.image_id != id);
        tables.jobs.retain(|job| job.image_id != id);
        Ok(())
    }

    async fn create_processed_image(
        &self,
        processed: &ProcessedImage,
    ) -> Result<(), StorageError> {
        lock(&self.tables).processed.push(processed.clone());
        Ok(())
    }

    async fn list_processed_images(
        &self,
        image_id: &str,
    ) -> Result<Vec<ProcessedImage>, StorageError> {
        Ok(lock(&self.tables)
            .processed
            .iter()
            .filter(|p| p.image_id == image_id)
            .cloned()
            .collect())
    }

    async fn get_processed_image(
        &self,
        image_id: &str,
        kind: OperationKind,
    ) -> Result<ProcessedImage, StorageError> {
        lock(&self.tables)
            .processed
            .iter()
            .rev()
            .find(|p| p.image_id == image_id && p.operation == kind)
            .cloned()
            .ok_or_else(|| not_found("processed image", &format!("{image_id}/{kind}")))
    }

    async fn create_job(&self, job: &ProcessingJob) -> Result<(), StorageError> {
        lock(&self.tables).jobs.push(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<ProcessingJob, StorageError> {
        lock(&self.tables)
            .jobs
            .iter()
            .find(|job| job.id == id)
            .cloned()
            .ok_or_else(|| not_found("job", id))
    }

    async fn latest_job_for_image(
        &self,
        image_id: &str,
    ) -> Result<Option<ProcessingJob>, StorageError> {
        Ok(lock(&self.tables)
            .jobs
            .iter()
            .rev()
            .find(|job| job.image_id == image_id)
            .cloned())
    }

    async fn record_job_attempt(&self, id: &str, attempt: u32) -> Result<(), StorageError> {
        let mut tables = lock(&self.tables);
        let job = tables
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| not_found("job", id))?;
        job.status = crate::types::JobStatus::Processing;
        job.attempts = attempt;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn update_job_status(&self, id: &str, update: JobUpdate) -> Result<(), StorageError> {
        let mut tables = lock(&self.tables);
        let job = tables
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| not_found("job", id))?;
        let now = Utc::now();
        job.status = update.status;
        job.error_message = update.error_message;
        job.warnings = update.warnings;
        job.updated_at = now;
        job.completed_at = update.status.is_terminal().then_some(now);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    general: Statistics,
    operations: BTreeMap<OperationKind, OperationStatistics>,
}

/// Statistics counters under a single lock.
#[derive(Debug, Default)]
pub struct MemoryStatsRepository {
    counters: Mutex<Counters>,
}

impl MemoryStatsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Fold `sample` into an average over `count` previous samples.
fn running_average(average: f64, count: u64, sample: f64) -> f64 {
    (average * count as f64 + sample) / (count + 1) as f64
}

#[async_trait]
impl StatsRepository for MemoryStatsRepository {
    async fn increment_uploaded(&self, size: u64) -> Result<(), StorageError> {
        let mut counters = lock(&self.counters);
        counters.general.total_uploaded += 1;
        counters.general.total_bytes += size;
        counters.general.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn increment_processed(&self, duration_ms: f64) -> Result<(), StorageError> {
        let mut counters = lock(&self.counters);
        let general = &mut counters.general;
        general.average_processing_time_ms = running_average(
            general.average_processing_time_ms,
            general.total_processed,
            duration_ms,
        );
        general.total_processed += 1;
        general.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn increment_failed(&self) -> Result<(), StorageError> {
        let mut counters = lock(&self.counters);
        counters.general.total_failed += 1;
        counters.general.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn update_operation_statistics(
        &self,
        kind: OperationKind,
        success: bool,
        duration_ms: f64,
    ) -> Result<(), StorageError> {
        let mut counters = lock(&self.counters);
        let stats = counters
            .operations
            .entry(kind)
            .or_insert_with(|| OperationStatistics::new(kind));
        stats.average_processing_time_ms =
            running_average(stats.average_processing_time_ms, stats.total, duration_ms);
        stats.total += 1;
        if success {
            stats.success += 1;
        } else {
            stats.failure += 1;
        }
        Ok(())
    }

    async fn get_statistics(&self) -> Result<Statistics, StorageError> {
        Ok(lock(&self.counters).general.clone())
    }

    async fn get_operation_statistics(&self) -> Result<Vec<OperationStatistics>, StorageError> {
        Ok(lock(&self.counters).operations.values().cloned().collect())
    }

    async fn get_most_used_operation(&self) -> Result<Option<OperationKind>, StorageError> {
        // Ties go to the kind declared first
        Ok(lock(&self.counters)
            .operations
            .values()
            .filter(|stats| stats.total > 0)
            .max_by(|a, b| a.total.cmp(&b.total).then(b.kind.cmp(&a.kind)))
            .map(|stats| stats.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageFormat, JobStatus, OperationParams, ProcessingTask};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn image(id: &str) -> Image {
        let now = Utc::now();
        Image {
            id: id.into(),
            original_name: format!("{id}.jpg"),
            size: 10,
            mime_type: "image/jpeg".into(),
            storage_path: format!("originals/{id}.jpg"),
            bucket: "images".into(),
            width: 1,
            height: 1,
            format: ImageFormat::Jpeg,
            status: ImageStatus::Uploaded,
            created_at: now,
            updated_at: now,
        }
    }

    fn processed(image_id: &str, kind: OperationKind, path: &str) -> ProcessedImage {
        ProcessedImage {
            id: path.into(),
            image_id: image_id.into(),
            operation: kind,
            parameters: Default::default(),
            path: path.into(),
            size: 1,
            mime_type: "image/jpeg".into(),
            format: ImageFormat::Jpeg,
            status: ImageStatus::Completed,
            created_at: Utc::now(),
        }
    }

    fn job(id: &str, image_id: &str) -> ProcessingJob {
        ProcessingJob::pending(
            &ProcessingTask {
                id: id.into(),
                image_id: image_id.into(),
                original_path: format!("originals/{image_id}.jpg"),
                bucket: "images".into(),
                operations: vec![OperationParams::new(OperationKind::Grayscale)],
                format: ImageFormat::Jpeg,
            },
            3,
        )
    }

    #[tokio::test]
    async fn test_object_round_trip_and_stream() {
        let store = MemoryObjectStore::new("images");
        store
            .upload("a/b.jpg", vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();
        assert!(store.exists("a/b.jpg").await.unwrap());
        assert_eq!(store.download("a/b.jpg").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.content_type("a/b.jpg").as_deref(), Some("image/jpeg"));

        let mut body = Vec::new();
        store
            .download_stream("a/b.jpg")
            .await
            .unwrap()
            .read_to_end(&mut body)
            .await
            .unwrap();
        assert_eq!(body, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = MemoryObjectStore::new("images");
        let err = store.download("nope").await.unwrap_err();
        assert_eq!(
            err,
            StorageError::ObjectNotFound {
                key: "nope".into()
            }
        );
        assert!(store
            .presigned_url("nope", Duration::from_secs(60))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_many_and_presigned_url() {
        let store = MemoryObjectStore::new("images");
        for key in ["x", "y", "z"] {
            store.upload(key, vec![0], "image/png").await.unwrap();
        }
        let url = store
            .presigned_url("z", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("memory://images/z?expires="));

        store
            .delete_many(&["x".to_string(), "y".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(store.keys(), vec!["z".to_string()]);
    }

    #[tokio::test]
    async fn test_list_images_newest_first_with_pagination() {
        let repo = MemoryImageRepository::new();
        for id in ["a", "b", "c"] {
            repo.create_image(&image(id)).await.unwrap();
        }
        let page = repo.list_images(2, 0).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(page.total, 3);

        let page = repo.list_images(2, 2).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "a");
    }

    #[tokio::test]
    async fn test_latest_processed_image_wins() {
        let repo = MemoryImageRepository::new();
        repo.create_processed_image(&processed("i", OperationKind::Resize, "p1"))
            .await
            .unwrap();
        repo.create_processed_image(&processed("i", OperationKind::Resize, "p2"))
            .await
            .unwrap();
        let latest = repo
            .get_processed_image("i", OperationKind::Resize)
            .await
            .unwrap();
        assert_eq!(latest.path, "p2");
        assert!(repo
            .get_processed_image("i", OperationKind::Crop)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_image_cascades() {
        let repo = MemoryImageRepository::new();
        repo.create_image(&image("i")).await.unwrap();
        repo.create_processed_image(&processed("i", OperationKind::Flip, "p"))
            .await
            .unwrap();
        repo.create_job(&job("t", "i")).await.unwrap();

        repo.delete_image("i").await.unwrap();
        assert!(repo.get_image("i").await.is_err());
        assert!(repo.list_processed_images("i").await.unwrap().is_empty());
        assert!(repo.get_job("t").await.is_err());
        assert!(repo.delete_image("i").await.is_err());
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let repo = MemoryImageRepository::new();
        repo.create_job(&job("t", "i")).await.unwrap();

        repo.record_job_attempt("t", 2).await.unwrap();
        let j = repo.get_job("t").await.unwrap();
        assert_eq!(j.status, JobStatus::Processing);
        assert_eq!(j.attempts, 2);
        assert!(j.completed_at.is_none());

        repo.update_job_status("t", JobUpdate::failed("boom"))
            .await
            .unwrap();
        let j = repo.get_job("t").await.unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error_message.as_deref(), Some("boom"));
        assert!(j.completed_at.is_some());

        let latest = repo.latest_job_for_image("i").await.unwrap().unwrap();
        assert_eq!(latest.id, "t");
    }

    #[tokio::test]
    async fn test_running_averages() {
        let repo = MemoryStatsRepository::new();
        repo.increment_processed(10.0).await.unwrap();
        repo.increment_processed(20.0).await.unwrap();
        repo.update_operation_statistics(OperationKind::Crop, true, 4.0)
            .await
            .unwrap();
        repo.update_operation_statistics(OperationKind::Crop, false, 0.0)
            .await
            .unwrap();

        let stats = repo.get_statistics().await.unwrap();
        assert_eq!(stats.total_processed, 2);
        assert!((stats.average_processing_time_ms - 15.0).abs() < f64::EPSILON);

        let ops = repo.get_operation_statistics().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!((ops[0].total, ops[0].success, ops[0].failure), (2, 1, 1));
        assert!((ops[0].average_processing_time_ms - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_most_used_operation() {
        let repo = MemoryStatsRepository::new();
        assert_eq!(repo.get_most_used_operation().await.unwrap(), None);

        for kind in [
            OperationKind::Flip,
            OperationKind::Resize,
            OperationKind::Resize,
            OperationKind::Flip,
            OperationKind::Crop,
        ] {
            repo.update_operation_statistics(kind, true, 1.0)
                .await
                .unwrap();
        }
        assert_eq!(
            repo.get_most_used_operation().await.unwrap(),
            Some(OperationKind::Resize)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_increments_are_exact() {
        let repo = Arc::new(MemoryStatsRepository::new());
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let repo = Arc::clone(&repo);
                tokio::spawn(async move {
                    for _ in 0..500 {
                        repo.increment_processed(1.0).await.unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(repo.get_statistics().await.unwrap().total_processed, 1000);
    }
}
