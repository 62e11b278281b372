//! Retry classification and backoff for task attempts.

use crate::error::TaskError;
use std::time::Duration;

/// Determine whether another attempt at the task could succeed.
///
/// Retryable: download failures and pipeline execution failures or timeouts.
/// Non-retryable: pipeline validation failures (unknown operation, invalid
/// parameters, unsupported, oversized or undecodable input) and exhausted
/// retries.
pub fn is_retryable(error: &TaskError) -> bool {
    match error {
        TaskError::Download { .. } => true,
        TaskError::Pipeline { source, .. } => !source.is_validation(),
        TaskError::RetriesExhausted { .. } => false,
    }
}

/// Linear backoff: the wait after attempt `attempt` (1-based) is `attempt * unit`.
pub fn backoff_duration(attempt: u32, unit: Duration) -> Duration {
    unit.saturating_mul(attempt)
}
