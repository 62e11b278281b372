use image::GenericImageView;

use super::params::{self, invalid};
use super::{transcode, Operation};
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

const KIND: OperationKind = OperationKind::Crop;

/// Cut a rectangle out of the image, clamped to its bounds.
pub struct CropOperation {
    default_quality: u8,
}

struct CropSettings {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    quality: u8,
}

impl CropOperation {
    pub fn new(default_quality: u8) -> Self {
        Self { default_quality }
    }

    fn settings(&self, params: &Parameters) -> Result<CropSettings, PipelineError> {
        let width = params::positive(params, "width", KIND)?
            .ok_or_else(|| invalid(KIND, "width is required"))?;
        let height = params::positive(params, "height", KIND)?
            .ok_or_else(|| invalid(KIND, "height is required"))?;
        Ok(CropSettings {
            x: params::offset(params, "x", KIND)?.unwrap_or(0),
            y: params::offset(params, "y", KIND)?.unwrap_or(0),
            width,
            height,
            quality: params::quality(params, self.default_quality, KIND)?,
        })
    }
}

impl Operation for CropOperation {
    fn kind(&self) -> OperationKind {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<(), PipelineError> {
        self.settings(params).map(|_| ())
    }

    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError> {
        let s = self.settings(params)?;
        transcode(input, s.quality, |image| {
            let (w, h) = image.dimensions();
            if s.x >= w || s.y >= h {
                return Err(invalid(
                    KIND,
                    format!("crop origin ({}, {}) lies outside {w}x{h} image", s.x, s.y),
                ));
            }
            let width = s.width.min(w - s.x);
            let height = s.height.min(h - s.y);
            Ok(image.crop_imm(s.x, s.y, width, height))
        })
    }
}
