//! Image operations and the fixed registry that resolves them by kind.
//!
//! An [`Operation`] takes encoded bytes and returns encoded bytes in the same
//! container format. Operations are synchronous and CPU-bound; the pipeline is
//! responsible for moving them off the async runtime.

pub mod codec;
mod crop;
mod flip;
pub mod font;
mod grayscale;
pub(crate) mod params;
mod resize;
mod rotate;
mod thumbnail;
mod watermark;

pub use crop::CropOperation;
pub use flip::FlipOperation;
pub use grayscale::GrayscaleOperation;
pub use resize::ResizeOperation;
pub use rotate::RotateOperation;
pub use thumbnail::ThumbnailOperation;
pub use watermark::{WatermarkOperation, WatermarkPosition};

use image::DynamicImage;

use crate::config::ProcessingConfig;
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

/// A stateless image transform.
pub trait Operation: Send + Sync {
    /// The kind this operation is registered under.
    fn kind(&self) -> OperationKind;

    /// Check parameters without touching pixel data.
    fn validate(&self, params: &Parameters) -> Result<(), PipelineError>;

    /// Apply the transform to encoded bytes.
    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError>;
}

/// Decode `input`, apply `transform`, and re-encode in the input's format.
pub(crate) fn transcode(
    input: &[u8],
    quality: u8,
    transform: impl FnOnce(DynamicImage) -> Result<DynamicImage, PipelineError>,
) -> Result<Vec<u8>, PipelineError> {
    let (image, format) = codec::decode(input)?;
    let output = transform(image)?;
    codec::encode(&output, format, quality)
}

/// Every operation, built once from configuration.
///
/// Lookup is an exhaustive match over [`OperationKind`], so adding a kind
/// without an implementation fails to compile.
pub struct OperationRegistry {
    resize: ResizeOperation,
    thumbnail: ThumbnailOperation,
    watermark: WatermarkOperation,
    crop: CropOperation,
    rotate: RotateOperation,
    flip: FlipOperation,
    grayscale: GrayscaleOperation,
}

impl OperationRegistry {
    pub fn new(config: &ProcessingConfig) -> Self {
        let quality = config.default_jpeg_quality;
        Self {
            resize: ResizeOperation::new(quality, config.max_image_dimension),
            thumbnail: ThumbnailOperation::new(
                config.default_thumbnail_size,
                config.max_thumbnail_size,
                quality,
            ),
            watermark: WatermarkOperation::new(
                config.watermark_text.clone(),
                config.watermark_opacity,
                config.watermark_font_size,
                config.max_image_dimension,
                quality,
            ),
            crop: CropOperation::new(quality),
            rotate: RotateOperation::new(quality),
            flip: FlipOperation::new(quality),
            grayscale: GrayscaleOperation::new(quality),
        }
    }

    pub fn get(&self, kind: OperationKind) -> &dyn Operation {
        match kind {
            OperationKind::Resize => &self.resize,
            OperationKind::Thumbnail => &self.thumbnail,
            OperationKind::Watermark => &self.watermark,
            OperationKind::Crop => &self.crop,
            OperationKind::Rotate => &self.rotate,
            OperationKind::Flip => &self.flip,
            OperationKind::Grayscale => &self.grayscale,
        }
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(&ProcessingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_every_kind() {
        let registry = OperationRegistry::default();
        for kind in OperationKind::ALL {
            assert_eq!(registry.get(kind).kind(), kind);
        }
    }

    #[test]
    fn test_every_operation_keeps_input_format() {
        let registry = OperationRegistry::default();
        let input = codec::fixtures::png(40, 30);
        let mut params = Parameters::new();
        params.insert("width".into(), 20.into());
        params.insert("height".into(), 10.into());
        params.insert("angle".into(), 90.into());

        for kind in OperationKind::ALL {
            let op = registry.get(kind);
            op.validate(&params).unwrap();
            let output = op.execute(&input, &params).unwrap();
            assert_eq!(
                crate::types::ImageFormat::detect(&output),
                Some(crate::types::ImageFormat::Png),
                "{kind} changed the container format"
            );
        }
    }
}
