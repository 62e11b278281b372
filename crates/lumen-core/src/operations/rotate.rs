use super::params::{self, invalid};
use super::{transcode, Operation};
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

const KIND: OperationKind = OperationKind::Rotate;

/// Clockwise rotation by a right angle. `-90` is accepted as `270`.
pub struct RotateOperation {
    default_quality: u8,
}

impl RotateOperation {
    pub fn new(default_quality: u8) -> Self {
        Self { default_quality }
    }

    fn angle(params: &Parameters) -> Result<u16, PipelineError> {
        match params::int(params, "angle", KIND)? {
            Some(90) => Ok(90),
            Some(180) => Ok(180),
            Some(270) | Some(-90) => Ok(270),
            Some(other) => Err(invalid(
                KIND,
                format!("angle must be 90, 180 or 270, got {other}"),
            )),
            None => Err(invalid(KIND, "angle is required")),
        }
    }
}

impl Operation for RotateOperation {
    fn kind(&self) -> OperationKind {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<(), PipelineError> {
        Self::angle(params).map(|_| ())
    }

    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError> {
        let angle = Self::angle(params)?;
        let quality = params::quality(params, self.default_quality, KIND)?;
        transcode(input, quality, |image| {
            Ok(match angle {
                90 => image.rotate90(),
                180 => image.rotate180(),
                _ => image.rotate270(),
            })
        })
    }
}
