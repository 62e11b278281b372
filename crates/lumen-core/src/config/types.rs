//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bootstrap broker addresses
    pub brokers: Vec<String>,

    /// Topic processing tasks are published to
    pub topic: String,

    /// Consumer group shared by all workers
    pub consumer_group: String,

    /// Partition count used when provisioning the topic
    pub partitions: u32,

    /// Replication factor used when provisioning the topic
    pub replication_factor: u32,

    /// How long a fetched but uncommitted message stays leased before redelivery
    pub redelivery_timeout_ms: u64,

    /// Per-fetch timeout used by batch reads
    pub batch_fetch_timeout_ms: u64,

    /// Deliveries of one uncommitted message before it is skipped; 0 never skips
    pub max_deliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: "image-processing".to_string(),
            consumer_group: "image-workers".to_string(),
            partitions: 3,
            replication_factor: 1,
            redelivery_timeout_ms: 30_000,
            batch_fetch_timeout_ms: 10,
            max_deliveries: 5,
        }
    }
}

impl BrokerConfig {
    pub fn redelivery_timeout(&self) -> Duration {
        Duration::from_millis(self.redelivery_timeout_ms)
    }

    pub fn batch_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_fetch_timeout_ms)
    }
}

/// Worker pool and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent consumer loops
    pub num_workers: usize,

    /// Attempts per task before the message is left for redelivery
    pub retry_attempts: u32,

    /// Linear backoff unit: the wait after attempt N is N times this
    pub retry_backoff_ms: u64,

    /// Timeout for a single pipeline stage
    pub stage_timeout_ms: u64,

    /// Interval between consumer statistics log lines
    pub stats_interval_secs: u64,

    /// How long shutdown waits for workers before abandoning them
    pub shutdown_timeout_secs: u64,

    /// Stop retrying as soon as an attempt fails validation
    pub fail_fast_on_validation: bool,

    /// Write failed status and failure statistics on every failed attempt,
    /// not only on the last one
    pub record_intermediate_failures: bool,

    /// Mark jobs `completed_with_warnings` when some stage artifacts were skipped
    pub report_partial_success: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            retry_attempts: 3,
            retry_backoff_ms: 2000,
            stage_timeout_ms: 30_000,
            stats_interval_secs: 30,
            shutdown_timeout_secs: 30,
            fail_fast_on_validation: true,
            record_intermediate_failures: true,
            report_partial_success: true,
        }
    }
}

impl WorkerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage endpoint; `memory://` selects the in-process store
    pub endpoint: String,

    /// Bucket holding originals and processed artifacts
    pub bucket: String,

    /// Lifetime of presigned download URLs
    pub presigned_url_expiry_secs: u64,

    /// Maximum accepted upload size
    pub max_upload_size_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "memory://".to_string(),
            bucket: "images".to_string(),
            presigned_url_expiry_secs: 3600,
            max_upload_size_mb: 50,
        }
    }
}

impl StorageConfig {
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.presigned_url_expiry_secs)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }
}

/// Image operation defaults and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Thumbnail edge used when `size` is not given
    pub default_thumbnail_size: u32,

    /// Largest accepted thumbnail edge
    pub max_thumbnail_size: u32,

    /// JPEG quality used when `quality` is not given
    pub default_jpeg_quality: u8,

    /// Watermark text used when `text` is not given
    pub watermark_text: String,

    /// Watermark opacity used when `opacity` is not given
    pub watermark_opacity: f64,

    /// Watermark glyph height used when `font_size` is not given
    pub watermark_font_size: u32,

    /// Maximum accepted width or height of an input image
    pub max_image_dimension: u32,

    /// File extensions picked up when uploading a directory
    pub supported_formats: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            default_thumbnail_size: 150,
            max_thumbnail_size: 1000,
            default_jpeg_quality: 85,
            watermark_text: "lumen".to_string(),
            watermark_opacity: 0.5,
            watermark_font_size: 24,
            max_image_dimension: 10_000,
            supported_formats: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "gif".to_string(),
                "webp".to_string(),
            ],
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
