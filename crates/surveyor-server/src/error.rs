//! Server error type with HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use surveyor_core::StoreError;
use surveyor_pipeline::PipelineError;

/// Specialized [`Result`] type for handler and manager operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of a server error, mapped onto an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unusable request.
    BadRequest,
    /// The addressed resource does not exist.
    NotFound,
    /// The request conflicts with existing state.
    Conflict,
    /// A backing store is unreachable.
    Unavailable,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Attaches a message, producing a full error.
    pub fn with_message(self, message: impl Into<String>) -> Error {
        Error {
            kind: self,
            message: message.into(),
        }
    }
}

/// A server error: kind plus user-facing message.
///
/// Serializes to the wire shape `{"success": false, "error": "…"}`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    /// Error classification.
    pub kind: ErrorKind,
    /// User-facing message.
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
        };
        (self.kind.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for Error {
    fn from(value: StoreError) -> Self {
        let kind = match &value {
            StoreError::AlreadyExists(_) => ErrorKind::Conflict,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::UnknownField(_) | StoreError::InvalidStatus(_) => ErrorKind::BadRequest,
            StoreError::Unavailable(_) => ErrorKind::Unavailable,
            StoreError::Backend(_) | StoreError::Serialization(_) => ErrorKind::Internal,
        };
        kind.with_message(value.to_string())
    }
}

impl From<PipelineError> for Error {
    fn from(value: PipelineError) -> Self {
        ErrorKind::Internal.with_message(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_http_kinds() {
        let err: Error = StoreError::NotFound("x".into()).into();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let err: Error = StoreError::AlreadyExists("x".into()).into();
        assert_eq!(err.kind, ErrorKind::Conflict);
        let err: Error = StoreError::InvalidStatus("nope".into()).into();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }
}
