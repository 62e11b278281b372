use super::params;
use super::{transcode, Operation};
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

const KIND: OperationKind = OperationKind::Grayscale;

pub struct GrayscaleOperation {
    default_quality: u8,
}

impl GrayscaleOperation {
    pub fn new(default_quality: u8) -> Self {
        Self { default_quality }
    }
}

impl Operation for GrayscaleOperation {
    fn kind(&self) -> OperationKind {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<(), PipelineError> {
        params::quality(params, self.default_quality, KIND).map(|_| ())
    }

    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError> {
        let quality = params::quality(params, self.default_quality, KIND)?;
        transcode(input, quality, |image| Ok(image.grayscale()))
    }
}
