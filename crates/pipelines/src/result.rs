use blueprintx_core::{JobType, JsonMap};
use thiserror::Error;

/// Outcome of a single pipeline invocation.
pub type PipelineResult = Result<JsonMap, PipelineError>;

/// Why a pipeline invocation failed.
///
/// Handlers never signal failure through their output payload; every failure is
/// one of these variants. The job runner classifies them into retry/DLQ decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// No handler is registered for this job type.
    #[error("unsupported job type: {0}")]
    UnsupportedJobType(JobType),

    /// The job input is unusable (missing or malformed fields).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The handler gave up waiting on an upstream call.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Any other failure. `details` carries the full diagnostic (error chain,
    /// upstream response body, ...) and is kept out of the short message.
    #[error("{message}")]
    Failed {
        message: String,
        details: Option<String>,
    },
}

impl PipelineError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed {
            message: msg.into(),
            details: None,
        }
    }

    /// Build a `Failed` error from any error value, keeping its source chain as details.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut details = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            details.push_str("\ncaused by: ");
            details.push_str(&cause.to_string());
            source = cause.source();
        }

        Self::Failed {
            message: err.to_string(),
            details: Some(details),
        }
    }

    /// Attach a full diagnostic to a `Failed` error. Other variants are returned as-is.
    pub fn with_details(self, details: impl Into<String>) -> Self {
        match self {
            Self::Failed { message, .. } => Self::Failed {
                message,
                details: Some(details.into()),
            },
            other => other,
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Failed { details, .. } => details.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream returned 503")]
    struct Upstream;

    #[derive(Debug, Error)]
    #[error("summary request failed")]
    struct Outer(#[source] Upstream);

    #[test]
    fn from_error_keeps_the_source_chain() {
        let err = PipelineError::from_error(&Outer(Upstream));
        assert_eq!(err.to_string(), "summary request failed");
        assert_eq!(
            err.details(),
            Some("summary request failed\ncaused by: upstream returned 503")
        );
    }

    #[test]
    fn details_only_attach_to_failed() {
        let err = PipelineError::timeout("vision call").with_details("trace");
        assert_eq!(err.details(), None);

        let err = PipelineError::failed("boom").with_details("trace");
        assert_eq!(err.details(), Some("trace"));
    }
}
