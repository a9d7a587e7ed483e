//! The wire-level error taxonomy.
//!
//! Component crates keep their own error enums; anything that reaches a
//! caller or the wire is mapped into [`CoreError`] first, which carries
//! the stable code, the HTTP status, and the retry hint.

use thiserror::Error;

/// Errors as callers and clients see them.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input; detail is bounded and safe to return.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate entity or forbidden state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid credential.
    #[error("unauthorized")]
    Unauthorized,

    /// Budget admission or request rate refused.
    #[error("rate limited, retry in {retry_after_s}s")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after_s: u64,
    },

    /// LLM provider or external channel unavailable after retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Store write queue saturated.
    #[error("ingestion backpressure, retry in {retry_after_s}s")]
    Backpressure {
        /// Suggested wait before retrying.
        retry_after_s: u64,
    },

    /// A tool handler returned an error result.
    #[error("tool failed: {0}")]
    ToolFailed(String),

    /// Operator rejected the action.
    #[error("action rejected: {0}")]
    ActionRejected(String),

    /// No approval arrived within the window.
    #[error("action timed out")]
    ActionTimedOut,

    /// The client cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected fault; logged server-side under the correlation id.
    #[error("internal error ({correlation_id})")]
    Internal {
        /// Id to quote when filing the problem.
        correlation_id: String,
    },
}

impl CoreError {
    /// Build an `Internal` with a fresh correlation id.
    pub fn internal() -> Self {
        CoreError::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Stable machine-readable code, used in push error messages.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Unauthorized => "unauthorized",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::UpstreamUnavailable(_) => "upstream_unavailable",
            CoreError::Backpressure { .. } => "backpressure",
            CoreError::ToolFailed(_) => "tool_failed",
            CoreError::ActionRejected(_) => "action_rejected",
            CoreError::ActionTimedOut => "action_timed_out",
            CoreError::Cancelled => "cancelled",
            CoreError::Internal { .. } => "internal",
        }
    }

    /// Conventional HTTP status for REST surfaces.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Unauthorized => 401,
            CoreError::RateLimited { .. } => 429,
            CoreError::Backpressure { .. } => 429,
            CoreError::UpstreamUnavailable(_) => 502,
            CoreError::ToolFailed(_)
            | CoreError::ActionRejected(_)
            | CoreError::ActionTimedOut => 422,
            CoreError::Cancelled => 499,
            CoreError::Internal { .. } => 500,
        }
    }

    /// Retry hint in seconds, for the kinds that carry one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            CoreError::RateLimited { retry_after_s } | CoreError::Backpressure { retry_after_s } => {
                Some(*retry_after_s)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Unauthorized.code(), "unauthorized");
        assert_eq!(CoreError::ActionTimedOut.code(), "action_timed_out");
    }

    #[test]
    fn statuses_are_conventional() {
        assert_eq!(CoreError::Validation("x".into()).http_status(), 400);
        assert_eq!(CoreError::NotFound("x".into()).http_status(), 404);
        assert_eq!(CoreError::Conflict("x".into()).http_status(), 409);
        assert_eq!(CoreError::Backpressure { retry_after_s: 5 }.http_status(), 429);
    }

    #[test]
    fn retry_hint_only_on_retryable_kinds() {
        assert_eq!(
            CoreError::RateLimited { retry_after_s: 30 }.retry_after(),
            Some(30)
        );
        assert_eq!(CoreError::Cancelled.retry_after(), None);
    }

    #[test]
    fn internal_has_unique_correlation() {
        let (a, b) = (CoreError::internal(), CoreError::internal());
        match (a, b) {
            (
                CoreError::Internal { correlation_id: ca },
                CoreError::Internal { correlation_id: cb },
            ) => assert_ne!(ca, cb),
            _ => unreachable!(),
        }
    }
}
