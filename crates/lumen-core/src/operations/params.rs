//! Typed accessors over loosely-typed operation parameters.
//!
//! Numbers may arrive as JSON integers or floats; a float is accepted where an
//! integer is expected as long as it has no fractional part.

use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

pub(crate) fn invalid(kind: OperationKind, message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidParameters {
        kind,
        message: message.into(),
    }
}

/// A signed integer parameter, if present.
pub(crate) fn int(
    params: &Parameters,
    key: &str,
    kind: OperationKind,
) -> Result<Option<i64>, PipelineError> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };
    match value.as_f64() {
        Some(n) if n.fract() == 0.0 && n.is_finite() => Ok(Some(n as i64)),
        _ => Err(invalid(kind, format!("{key} must be an integer, got {value}"))),
    }
}

/// A strictly positive pixel count, if present.
pub(crate) fn positive(
    params: &Parameters,
    key: &str,
    kind: OperationKind,
) -> Result<Option<u32>, PipelineError> {
    match int(params, key, kind)? {
        None => Ok(None),
        Some(n) if n > 0 && n <= u32::MAX as i64 => Ok(Some(n as u32)),
        Some(n) => Err(invalid(kind, format!("{key} must be positive, got {n}"))),
    }
}

/// A non-negative offset, if present.
pub(crate) fn offset(
    params: &Parameters,
    key: &str,
    kind: OperationKind,
) -> Result<Option<u32>, PipelineError> {
    match int(params, key, kind)? {
        None => Ok(None),
        Some(n) if n >= 0 && n <= u32::MAX as i64 => Ok(Some(n as u32)),
        Some(n) => Err(invalid(kind, format!("{key} must be >= 0, got {n}"))),
    }
}

pub(crate) fn float(
    params: &Parameters,
    key: &str,
    kind: OperationKind,
) -> Result<Option<f64>, PipelineError> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };
    value
        .as_f64()
        .map(Some)
        .ok_or_else(|| invalid(kind, format!("{key} must be a number, got {value}")))
}

pub(crate) fn boolean(
    params: &Parameters,
    key: &str,
    kind: OperationKind,
) -> Result<Option<bool>, PipelineError> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };
    value
        .as_bool()
        .map(Some)
        .ok_or_else(|| invalid(kind, format!("{key} must be a boolean, got {value}")))
}

pub(crate) fn text<'a>(
    params: &'a Parameters,
    key: &str,
    kind: OperationKind,
) -> Result<Option<&'a str>, PipelineError> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };
    value
        .as_str()
        .map(Some)
        .ok_or_else(|| invalid(kind, format!("{key} must be a string, got {value}")))
}

/// JPEG quality in 1..=100, falling back to `default`.
pub(crate) fn quality(
    params: &Parameters,
    default: u8,
    kind: OperationKind,
) -> Result<u8, PipelineError> {
    match int(params, "quality", kind)? {
        None => Ok(default),
        Some(q) if (1..=100).contains(&q) => Ok(q as u8),
        Some(q) => Err(invalid(
            kind,
            format!("quality must be between 1 and 100, got {q}"),
        )),
    }
}
