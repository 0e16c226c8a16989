//! Error types for the orchestrator
//!
//! Only not-found, malformed-request and busy errors ever reach an API
//! caller. Everything raised inside a unit of work is absorbed into a
//! degraded status on the affected parameter or scope.

use crate::state_machine::SessionState;
use std::time::Duration;

/// Main orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    /// Session, scope or parameter missing
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Re-entrant registration or execution
    #[error("duplicate request: {0}")]
    DuplicateRequest(String),

    /// Malformed client request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// External subsystem did not answer in time
    #[error("external subsystem timed out after {}ms", .0.as_millis())]
    ExternalTimeout(Duration),

    /// External subsystem returned an error
    #[error("external subsystem failed: {0}")]
    ExternalFailure(String),

    /// Malformed page, parameter or orchestrator configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Session lifecycle violation
    #[error("illegal session transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// Unexpected failure inside a unit of work
    #[error("fatal: {0}")]
    Fatal(String),

    /// Worker pools are closed
    #[error("dispatcher has been shut down")]
    Shutdown,

    /// Filesystem failure while loading configuration
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`VerdictError::NotFound`]
    NotFound,
    /// See [`VerdictError::DuplicateRequest`]
    DuplicateRequest,
    /// See [`VerdictError::InvalidRequest`]
    InvalidRequest,
    /// See [`VerdictError::ExternalTimeout`]
    ExternalTimeout,
    /// See [`VerdictError::ExternalFailure`]
    ExternalFailure,
    /// See [`VerdictError::Configuration`]
    Configuration,
    /// Lifecycle, shutdown and unit crashes
    Fatal,
}

impl VerdictError {
    /// Create not-found error
    #[inline]
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Classify error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateRequest(_) => ErrorKind::DuplicateRequest,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::ExternalTimeout(_) => ErrorKind::ExternalTimeout,
            Self::ExternalFailure(_) => ErrorKind::ExternalFailure,
            Self::Configuration(_) | Self::Io(_) => ErrorKind::Configuration,
            Self::IllegalTransition { .. } | Self::Fatal(_) | Self::Shutdown => ErrorKind::Fatal,
        }
    }

    /// Check if error is reported synchronously to the API caller
    #[inline]
    #[must_use]
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::InvalidRequest(_) | Self::DuplicateRequest(_)
        )
    }

    /// Check if error is absorbed as a degraded status instead of surfacing
    #[inline]
    #[must_use]
    pub fn degrades(&self) -> bool {
        !self.is_surfaced()
    }

    /// Check if error comes from an external collaborator
    #[inline]
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalTimeout(_) | Self::ExternalFailure(_))
    }
}

impl From<ConnectorError> for VerdictError {
    fn from(value: ConnectorError) -> Self {
        match value {
            ConnectorError::Timeout(after) => Self::ExternalTimeout(after),
            ConnectorError::Failure(msg) => Self::ExternalFailure(msg),
            ConnectorError::Unsupported(msg) => Self::Configuration(msg),
        }
    }
}

/// Errors surfaced by data-source connectors and the deferred-search service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// Call did not finish in time
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Remote side reported an error
    #[error("{0}")]
    Failure(String),

    /// Request cannot be served by this connector
    #[error("unsupported request: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = VerdictError::not_found("session", "01ABC");
        assert_eq!(err.to_string(), "session not found: 01ABC");
        assert!(err.is_surfaced());
    }

    #[test]
    fn external_errors_are_not_surfaced() {
        let err = VerdictError::ExternalTimeout(Duration::from_millis(1500));
        assert!(!err.is_surfaced());
        assert!(err.is_external());
        assert!(err.degrades());
        assert_eq!(err.kind(), ErrorKind::ExternalTimeout);
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn connector_error_conversion() {
        let err: VerdictError = ConnectorError::Failure("boom".into()).into();
        assert_eq!(err.kind(), ErrorKind::ExternalFailure);

        let err: VerdictError = ConnectorError::Unsupported("ssh".into()).into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
