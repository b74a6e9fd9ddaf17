//! Error taxonomy for query execution

use shardql_plan::PlanError;
use shardql_registry::RegistryError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

/// Stable error classes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    IllegalArgument,
    BadProtocolMessage,
    MemoryLimitExceeded,
    IllegalState,
    RequestFailed,
    RequestTimeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::IllegalArgument => "ILLEGAL_ARGUMENT",
            ErrorCode::BadProtocolMessage => "BAD_PROTOCOL_MESSAGE",
            ErrorCode::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            ErrorCode::IllegalState => "ILLEGAL_STATE",
            ErrorCode::RequestFailed => "REQUEST_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the request executor classified a failed shard request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    Network,
    Service,
    Throttled,
    Timeout,
    Security,
}

/// A shard request failure, already classified by the request executor.
///
/// The engine never retries; it surfaces these unchanged.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} error: {message}")]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl RequestError {
    pub fn new(kind: RequestErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Bad protocol message: {0}")]
    BadProtocolMessage(String),

    #[error("Memory limit exceeded in {context}: requested {requested} bytes with {used} of {limit} in use")]
    MemoryLimitExceeded {
        context: String,
        requested: u64,
        used: u64,
        limit: u64,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueryError::IllegalArgument(_) => ErrorCode::IllegalArgument,
            QueryError::BadProtocolMessage(_) => ErrorCode::BadProtocolMessage,
            QueryError::MemoryLimitExceeded { .. } => ErrorCode::MemoryLimitExceeded,
            QueryError::IllegalState(_) => ErrorCode::IllegalState,
            QueryError::Request(_) => ErrorCode::RequestFailed,
            QueryError::Timeout(_) => ErrorCode::RequestTimeout,
        }
    }

    /// Only request failures the executor marked retryable may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Request(e) if e.retryable)
    }
}

impl From<PlanError> for QueryError {
    fn from(err: PlanError) -> Self {
        QueryError::BadProtocolMessage(err.to_string())
    }
}

impl From<RegistryError> for QueryError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidArgument { .. } => QueryError::IllegalArgument(err.to_string()),
            _ => QueryError::BadProtocolMessage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            QueryError::IllegalArgument("x".into()).code(),
            ErrorCode::IllegalArgument
        );
        assert_eq!(ErrorCode::MemoryLimitExceeded.to_string(), "MEMORY_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_request_errors_pass_through() {
        let err: QueryError =
            RequestError::new(RequestErrorKind::Throttled, "slow down", true).into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Throttled error: slow down");

        let err: QueryError = RequestError::new(RequestErrorKind::Security, "denied", false).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unknown_function_is_protocol_error() {
        let err: QueryError = RegistryError::FunctionNotFound("soundex".into()).into();
        assert_eq!(err.code(), ErrorCode::BadProtocolMessage);
    }
}
