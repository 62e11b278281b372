use image::imageops::FilterType;

use super::params::{self, invalid};
use super::{transcode, Operation};
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

const KIND: OperationKind = OperationKind::Thumbnail;

/// Square thumbnails: fit inside `size`×`size`, or fill it and centre-crop
/// when `crop_to_fit` is set.
pub struct ThumbnailOperation {
    default_size: u32,
    max_size: u32,
    default_quality: u8,
}

impl ThumbnailOperation {
    pub fn new(default_size: u32, max_size: u32, default_quality: u8) -> Self {
        Self {
            default_size,
            max_size,
            default_quality,
        }
    }

    fn settings(&self, params: &Parameters) -> Result<(u32, bool, u8), PipelineError> {
        let size = params::positive(params, "size", KIND)?.unwrap_or(self.default_size);
        if size > self.max_size {
            return Err(invalid(
                KIND,
                format!("size {size} exceeds maximum {}", self.max_size),
            ));
        }
        let crop_to_fit = params::boolean(params, "crop_to_fit", KIND)?.unwrap_or(false);
        let quality = params::quality(params, self.default_quality, KIND)?;
        Ok((size, crop_to_fit, quality))
    }
}

impl Operation for ThumbnailOperation {
    fn kind(&self) -> OperationKind {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<(), PipelineError> {
        self.settings(params).map(|_| ())
    }

    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError> {
        let (size, crop_to_fit, quality) = self.settings(params)?;
        transcode(input, quality, |image| {
            Ok(if crop_to_fit {
                image.resize_to_fill(size, size, FilterType::Lanczos3)
            } else {
                image.resize(size, size, FilterType::Lanczos3)
            })
        })
    }
}
