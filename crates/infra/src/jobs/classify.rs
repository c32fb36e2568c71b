//! Failure classification: error message → `FailureReason` → retry verdict.

use blueprintx_pipelines::PipelineError;

use crate::dlq::FailureReason;

/// Longest error message stored on a job or DLQ entry.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded", "connection timeout"];

// Quota errors usually need someone to act, so they are not retried.
const PERMANENT_PATTERNS: &[&str] = &[
    "invalid_input",
    "validation error",
    "invalid document",
    "file not found",
    "permission denied",
    "authentication failed",
    "invalid api key",
    "quota exceeded",
];

const EXTERNAL_SERVICE_PATTERNS: &[&str] = &[
    "api error",
    "service unavailable",
    "unavailable",
    "rate limit",
    "500",
    "502",
    "503",
    "504",
];

/// Classify an error message (case-insensitive substring match).
///
/// Categories are checked in order: timeout, permanent, missing/required input,
/// external service. Anything else is `Unknown`.
pub fn classify_error(message: &str) -> FailureReason {
    let lower = message.to_lowercase();

    if TIMEOUT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureReason::Timeout;
    }
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureReason::PermanentError;
    }
    if lower.contains("input") && (lower.contains("missing") || lower.contains("required")) {
        return FailureReason::InvalidInput;
    }
    if EXTERNAL_SERVICE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureReason::ExternalServiceError;
    }
    FailureReason::Unknown
}

/// Classify a pipeline failure. Structured variants are mapped directly; only
/// free-form failures go through message matching.
pub fn classify_pipeline_error(err: &PipelineError) -> FailureReason {
    match err {
        PipelineError::UnsupportedJobType(_) => FailureReason::PermanentError,
        PipelineError::InvalidInput(_) => FailureReason::InvalidInput,
        PipelineError::Timeout(_) => FailureReason::Timeout,
        PipelineError::Failed { message, .. } => classify_error(message),
    }
}

/// `PermanentError` and `InvalidInput` are never retried; everything else is,
/// subject to the attempt ceiling.
pub fn is_retryable(reason: FailureReason) -> bool {
    !matches!(
        reason,
        FailureReason::PermanentError | FailureReason::InvalidInput
    )
}

/// Cut a message to `MAX_ERROR_MESSAGE_CHARS` characters (never splits a char).
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
