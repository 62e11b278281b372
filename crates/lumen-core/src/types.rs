//! Core data types shared by the pipeline, the stores and the broker.
//!
//! Wire types (`ProcessingTask`, `OperationParams`) serialize as camelCase JSON;
//! they are what travels through the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Lifecycle of an uploaded image: `uploaded → processing → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a persisted processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    /// Completed, but at least one stage's artifact could not be stored
    CompletedWithWarnings,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedWithWarnings => "completed_with_warnings",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithWarnings | Self::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of image transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Resize,
    Thumbnail,
    Watermark,
    Crop,
    Rotate,
    Flip,
    Grayscale,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [OperationKind; 7] = [
        Self::Resize,
        Self::Thumbnail,
        Self::Watermark,
        Self::Crop,
        Self::Rotate,
        Self::Flip,
        Self::Grayscale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::Thumbnail => "thumbnail",
            Self::Watermark => "watermark",
            Self::Crop => "crop",
            Self::Rotate => "rotate",
            Self::Flip => "flip",
            Self::Grayscale => "grayscale",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PipelineError::UnknownOperation {
                kind: s.to_string(),
            })
    }
}

/// A scalar operation parameter.
///
/// Untagged so that `{"size": 50, "crop_to_fit": true}` deserializes naturally.
/// Variant order matters: integers are tried before floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value; integers and floats both qualify.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Named operation parameters.
pub type Parameters = BTreeMap<String, ParamValue>;

/// One pipeline stage: an operation name plus its parameters.
///
/// The name is kept as the caller sent it and resolved when the pipeline runs,
/// so a task naming an unknown operation still deserializes and fails as a
/// pipeline error rather than as a malformed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationParams {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl OperationParams {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            parameters: Parameters::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Resolve the operation name against the closed set of kinds.
    pub fn operation_kind(&self) -> Result<OperationKind, PipelineError> {
        self.kind.parse()
    }
}

/// Supported image container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }

    /// File extension used for stored objects.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    /// Detect the format from magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
            return Some(Self::Jpeg);
        }
        if bytes.len() >= 4 && bytes[0] == 0x89 && &bytes[1..4] == b"PNG" {
            return Some(Self::Png);
        }
        if bytes.len() >= 4 && &bytes[0..4] == b"GIF8" {
            return Some(Self::Gif);
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(Self::Webp);
        }
        None
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basic facts about an image, read from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub size: u64,
}

/// Identity and lifecycle record of an uploaded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    pub original_name: String,
    pub size: u64,
    pub mime_type: String,
    pub storage_path: String,
    pub bucket: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub status: ImageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unit of work placed on the broker.
///
/// `operations` order is the order stages are chained in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTask {
    pub id: String,
    pub image_id: String,
    pub original_path: String,
    pub bucket: String,
    pub operations: Vec<OperationParams>,
    pub format: ImageFormat,
}

/// One stored artifact of a completed pipeline stage. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedImage {
    pub id: String,
    pub image_id: String,
    pub operation: OperationKind,
    pub parameters: Parameters,
    pub path: String,
    pub size: u64,
    pub mime_type: String,
    pub format: ImageFormat,
    pub status: ImageStatus,
    pub created_at: DateTime<Utc>,
}

/// Durable record of whether a task concluded. `id` equals the task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub id: String,
    pub image_id: String,
    pub operations: Vec<OperationParams>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    /// Stages whose artifacts were skipped during persistence
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    /// A fresh pending job for `task`.
    pub fn pending(task: &ProcessingTask, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: task.id.clone(),
            image_id: task.image_id.clone(),
            operations: task.operations.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            error_message: None,
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A status transition applied to a job row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
}

impl JobUpdate {
    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            error_message: None,
            warnings: Vec::new(),
        }
    }

    pub fn completed_with_warnings(warnings: Vec<String>) -> Self {
        Self {
            status: JobStatus::CompletedWithWarnings,
            error_message: None,
            warnings,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(message.into()),
            warnings: Vec::new(),
        }
    }
}

/// Aggregate processing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_uploaded: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    /// Cumulative bytes uploaded
    pub total_bytes: u64,
    /// Running average over every processed event
    pub average_processing_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_used_operation: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-operation counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatistics {
    pub kind: OperationKind,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub average_processing_time_ms: f64,
}

impl OperationStatistics {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            total: 0,
            success: 0,
            failure: 0,
            average_processing_time_ms: 0.0,
        }
    }
}

/// Aggregate plus per-operation statistics with derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStatistics {
    pub general: Statistics,
    pub operations: Vec<OperationStatistics>,
    /// Percentage of processed events that did not fail; 0 when nothing was processed
    pub success_rate: f64,
}

/// Progress view of an image, as reported to callers polling for completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusReport {
    pub image_id: String,
    pub status: ImageStatus,
    /// 0..=100
    pub progress: u8,
    pub processed_operations: usize,
    pub total_operations: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_round_trips_names() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert_eq!(
            "Thumbnail".parse::<OperationKind>().unwrap(),
            OperationKind::Thumbnail
        );
    }

    #[test]
    fn test_unknown_operation_kind() {
        let err = "blur".parse::<OperationKind>().unwrap_err();
        assert_eq!(
            err,
            PipelineError::UnknownOperation {
                kind: "blur".into()
            }
        );
    }

    #[test]
    fn test_param_value_untagged_decoding() {
        let params: Parameters =
            serde_json::from_str(r#"{"size": 50, "opacity": 0.5, "crop": true, "text": "hi"}"#)
                .unwrap();
        assert_eq!(params["size"], ParamValue::Int(50));
        assert_eq!(params["opacity"], ParamValue::Float(0.5));
        assert_eq!(params["crop"], ParamValue::Bool(true));
        assert_eq!(params["text"].as_str(), Some("hi"));
        assert_eq!(params["size"].as_f64(), Some(50.0));
    }

    #[test]
    fn test_task_wire_format() {
        let task = ProcessingTask {
            id: "t1".into(),
            image_id: "i1".into(),
            original_path: "originals/i1.jpg".into(),
            bucket: "images".into(),
            operations: vec![OperationParams::new(OperationKind::Thumbnail).with("size", 50)],
            format: ImageFormat::Jpeg,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["imageId"], "i1");
        assert_eq!(json["operations"][0]["type"], "thumbnail");
        assert_eq!(json["operations"][0]["parameters"]["size"], 50);
        assert_eq!(json["format"], "jpeg");
    }

    #[test]
    fn test_unknown_operation_still_deserializes() {
        let op: OperationParams = serde_json::from_str(r#"{"type": "sharpen"}"#).unwrap();
        assert!(op.parameters.is_empty());
        assert!(op.operation_kind().is_err());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ImageFormat::detect(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(
            ImageFormat::detect(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A]),
            Some(ImageFormat::Png)
        );
        assert_eq!(ImageFormat::detect(b"GIF89a"), Some(ImageFormat::Gif));
        assert_eq!(
            ImageFormat::detect(b"RIFF\0\0\0\0WEBPVP8L"),
            Some(ImageFormat::Webp)
        );
        assert_eq!(ImageFormat::detect(b"BM\0\0"), None);
        assert_eq!(ImageFormat::detect(&[]), None);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::CompletedWithWarnings.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert_eq!(
            serde_json::to_string(&JobStatus::CompletedWithWarnings).unwrap(),
            "\"completed_with_warnings\""
        );
    }
}
