//! API error types and responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use super::JSend;
use crate::core::CoordinatorError;

/// API error type
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Coordinator(err) => coordinator_status(err),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Internal(_) => "InternalError",
            ApiError::Coordinator(err) => err.kind(),
        }
    }
}

fn coordinator_status(err: &CoordinatorError) -> StatusCode {
    use CoordinatorError::*;
    match err {
        InvalidManifest(_)
        | RecoveryInsufficientShares { .. }
        | RecoveryUnknownHolder(_)
        | RecoveryShareMismatch(_)
        | RecoveryUnsealFailed(_)
        | CertificateIssuanceFailed(_) => StatusCode::BAD_REQUEST,
        QuoteVerificationFailed(_) | SecretNotUserDefined(_) => StatusCode::FORBIDDEN,
        UnknownMarbleType(_) | UnknownPackage(_) | SecretNotFound(_) | InstanceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        InvalidState { .. } | MaxActivationsExceeded { .. } | InstanceAlreadyActive(_) => {
            StatusCode::CONFLICT
        }
        Quote(_) | Initialization(_) => StatusCode::SERVICE_UNAVAILABLE,
        SecretGeneration(_) | Recovery(_) | Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = JSend::<()> {
            status: if status.is_server_error() { "error" } else { "fail" },
            data: None,
            message: Some(self.to_string()),
            code: Some(self.code()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<base64::DecodeError> for ApiError {
    fn from(err: base64::DecodeError) -> Self {
        ApiError::BadRequest(format!("Invalid base64 encoding: {}", err))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("Worker task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::State;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CoordinatorError::InvalidManifest("x".into()), StatusCode::BAD_REQUEST),
            (
                CoordinatorError::InvalidState {
                    operation: "activate",
                    state: State::AcceptingManifest,
                },
                StatusCode::CONFLICT,
            ),
            (CoordinatorError::UnknownMarbleType("m".into()), StatusCode::NOT_FOUND),
            (
                CoordinatorError::MaxActivationsExceeded {
                    marble_type: "m".into(),
                    limit: 1,
                },
                StatusCode::CONFLICT,
            ),
            (CoordinatorError::SecretNotUserDefined("s".into()), StatusCode::FORBIDDEN),
            (CoordinatorError::Initialization("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_codes_come_from_kind() {
        let err = ApiError::from(CoordinatorError::InstanceNotFound("i".into()));
        assert_eq!(err.code(), "InstanceNotFound");
        assert_eq!(ApiError::BadRequest("b".into()).code(), "BadRequest");
    }
}
