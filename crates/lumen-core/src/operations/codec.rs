//! Decoding and re-encoding of stage bytes.
//!
//! Every operation decodes its input, transforms pixels, and writes the result
//! back in the input's container format.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;

use crate::error::PipelineError;
use crate::types::{ImageFormat, ImageInfo};

fn codec_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Gif => image::ImageFormat::Gif,
        ImageFormat::Webp => image::ImageFormat::WebP,
    }
}

/// Detect the container format, rejecting empty or unsupported input.
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    ImageFormat::detect(bytes).ok_or_else(|| PipelineError::UnsupportedFormat {
        format: image::guess_format(bytes)
            .map(|f| format!("{:?}", f).to_lowercase())
            .unwrap_or_else(|_| "unknown".to_string()),
    })
}

/// Decode bytes into pixels, returning the detected format alongside.
pub fn decode(bytes: &[u8]) -> Result<(DynamicImage, ImageFormat), PipelineError> {
    let format = detect_format(bytes)?;
    let image = image::load_from_memory_with_format(bytes, codec_format(format)).map_err(|e| {
        PipelineError::Decode {
            message: e.to_string(),
        }
    })?;
    Ok((image, format))
}

/// Read dimensions from the header without decoding pixel data.
pub fn inspect(bytes: &[u8]) -> Result<ImageInfo, PipelineError> {
    let format = detect_format(bytes)?;
    let reader = image::ImageReader::with_format(Cursor::new(bytes), codec_format(format));
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| PipelineError::Decode {
            message: e.to_string(),
        })?;
    Ok(ImageInfo {
        width,
        height,
        format,
        size: bytes.len() as u64,
    })
}

/// Encode pixels in `format`. `quality` only applies to JPEG.
pub fn encode(
    image: &DynamicImage,
    format: ImageFormat,
    quality: u8,
) -> Result<Vec<u8>, PipelineError> {
    let encode_err = |e: image::ImageError| PipelineError::Encode {
        format,
        message: e.to_string(),
    };

    let mut buffer = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel
            let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
            DynamicImage::ImageRgb8(image.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(encode_err)?;
        }
        ImageFormat::Png | ImageFormat::Gif | ImageFormat::Webp => {
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_to(&mut Cursor::new(&mut buffer), codec_format(format))
                .map_err(encode_err)?;
        }
    }
    Ok(buffer)
}

/// Dimensions of encoded bytes, for assertions and reporting.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), PipelineError> {
    decode(bytes).map(|(image, _)| image.dimensions())
}
