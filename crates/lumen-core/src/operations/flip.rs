use super::params::{self, invalid};
use super::{transcode, Operation};
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

const KIND: OperationKind = OperationKind::Flip;

/// Mirror the image. `direction` is `horizontal` (default) or `vertical`.
pub struct FlipOperation {
    default_quality: u8,
}

impl FlipOperation {
    pub fn new(default_quality: u8) -> Self {
        Self { default_quality }
    }

    fn vertical(params: &Parameters) -> Result<bool, PipelineError> {
        match params::text(params, "direction", KIND)? {
            None => Ok(false),
            Some(d) if d.eq_ignore_ascii_case("horizontal") => Ok(false),
            Some(d) if d.eq_ignore_ascii_case("vertical") => Ok(true),
            Some(d) => Err(invalid(
                KIND,
                format!("direction must be horizontal or vertical, got {d}"),
            )),
        }
    }
}

impl Operation for FlipOperation {
    fn kind(&self) -> OperationKind {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<(), PipelineError> {
        Self::vertical(params).map(|_| ())
    }

    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError> {
        let vertical = Self::vertical(params)?;
        let quality = params::quality(params, self.default_quality, KIND)?;
        transcode(input, quality, |image| {
            Ok(if vertical {
                image.flipv()
            } else {
                image.fliph()
            })
        })
    }
}
