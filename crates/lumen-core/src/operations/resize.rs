use image::imageops::FilterType;
use image::GenericImageView;

use super::params::{self, invalid};
use super::{transcode, Operation};
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

const KIND: OperationKind = OperationKind::Resize;

/// Resize to a width, a height, or a bounding box.
///
/// With a single dimension the other one follows the source aspect ratio.
/// With both, `keep_aspect` (default true) fits the image inside the box;
/// otherwise the image is stretched to exactly that size.
pub struct ResizeOperation {
    default_quality: u8,
    max_dimension: u32,
}

struct ResizeSettings {
    width: Option<u32>,
    height: Option<u32>,
    keep_aspect: bool,
    quality: u8,
}

impl ResizeOperation {
    pub fn new(default_quality: u8, max_dimension: u32) -> Self {
        Self {
            default_quality,
            max_dimension,
        }
    }

    fn settings(&self, params: &Parameters) -> Result<ResizeSettings, PipelineError> {
        let width = params::positive(params, "width", KIND)?;
        let height = params::positive(params, "height", KIND)?;
        if width.is_none() && height.is_none() {
            return Err(invalid(KIND, "width or height is required"));
        }
        for (name, value) in [("width", width), ("height", height)] {
            if let Some(v) = value.filter(|v| *v > self.max_dimension) {
                return Err(invalid(
                    KIND,
                    format!("{name} {v} exceeds maximum {}", self.max_dimension),
                ));
            }
        }
        Ok(ResizeSettings {
            width,
            height,
            keep_aspect: params::boolean(params, "keep_aspect", KIND)?.unwrap_or(true),
            quality: params::quality(params, self.default_quality, KIND)?,
        })
    }
}

impl ResizeOperation {
    /// Reject a dimension computed from the aspect ratio that exceeds the limit.
    fn derived(&self, name: &str, value: u32) -> Result<u32, PipelineError> {
        if value > self.max_dimension {
            return Err(invalid(
                KIND,
                format!(
                    "computed {name} {value} exceeds maximum {}",
                    self.max_dimension
                ),
            ));
        }
        Ok(value)
    }
}

/// Scale `other` by `target / source`, never below one pixel.
fn proportional(other: u32, target: u32, source: u32) -> u32 {
    let scaled = (other as f64 * target as f64 / source.max(1) as f64).round();
    (scaled as u32).max(1)
}

impl Operation for ResizeOperation {
    fn kind(&self) -> OperationKind {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<(), PipelineError> {
        self.settings(params).map(|_| ())
    }

    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError> {
        let settings = self.settings(params)?;
        transcode(input, settings.quality, |image| {
            let (w, h) = image.dimensions();
            let resized = match (settings.width, settings.height) {
                (Some(tw), Some(th)) if settings.keep_aspect => {
                    image.resize(tw, th, FilterType::Lanczos3)
                }
                (Some(tw), Some(th)) => image.resize_exact(tw, th, FilterType::Lanczos3),
                (Some(tw), None) => {
                    let th = self.derived("height", proportional(h, tw, w))?;
                    image.resize_exact(tw, th, FilterType::Lanczos3)
                }
                (None, Some(th)) => {
                    let tw = self.derived("width", proportional(w, th, h))?;
                    image.resize_exact(tw, th, FilterType::Lanczos3)
                }
                (None, None) => image,
            };
            Ok(resized)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::codec::{self, fixtures};

    fn op() -> ResizeOperation {
        ResizeOperation::new(85, 10_000)
    }

    fn params(pairs: &[(&str, i64)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), (*v).into()))
            .collect()
    }

    #[test]
    fn test_width_only_keeps_aspect_ratio() {
        let out = op()
            .execute(&fixtures::jpeg(200, 100), &params(&[("width", 100)]))
            .unwrap();
        assert_eq!(codec::dimensions(&out).unwrap(), (100, 50));
    }

    #[test]
    fn test_height_only_keeps_aspect_ratio() {
        let out = op()
            .execute(&fixtures::jpeg(200, 100), &params(&[("height", 20)]))
            .unwrap();
        assert_eq!(codec::dimensions(&out).unwrap(), (40, 20));
    }

    #[test]
    fn test_box_fits_inside_when_keeping_aspect() {
        let out = op()
            .execute(
                &fixtures::jpeg(200, 100),
                &params(&[("width", 50), ("height", 50)]),
            )
            .unwrap();
        assert_eq!(codec::dimensions(&out).unwrap(), (50, 25));
    }

    #[test]
    fn test_box_stretches_without_keep_aspect() {
        let mut p = params(&[("width", 50), ("height", 50)]);
        p.insert("keep_aspect".into(), false.into());
        let out = op().execute(&fixtures::jpeg(200, 100), &p).unwrap();
        assert_eq!(codec::dimensions(&out).unwrap(), (50, 50));
    }

    #[test]
    fn test_requires_a_dimension() {
        let err = op().validate(&Parameters::new()).unwrap_err();
        assert!(err.to_string().contains("width or height is required"));
    }

    #[test]
    fn test_rejects_computed_dimension_above_limit() {
        let op = ResizeOperation::new(85, 1000);
        let err = op
            .execute(&fixtures::png(400, 2), &params(&[("height", 1000)]))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("computed width 200000"));

        let err = op
            .execute(&fixtures::png(2, 400), &params(&[("width", 1000)]))
            .unwrap_err();
        assert!(err.to_string().contains("computed height 200000"));
    }

    #[test]
    fn test_rejects_dimension_above_limit() {
        let err = op().validate(&params(&[("width", 20_000)])).unwrap_err();
        assert!(err.is_validation());
    }
}
