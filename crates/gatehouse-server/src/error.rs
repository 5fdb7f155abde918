//! Server error types and HTTP response handling

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use gatehouse_core::store::StoreError;

/// Server error type for HTTP handlers
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request (body, query, unknowns, media type)
    #[error("{0}")]
    InvalidParameter(String),

    /// The request body exceeded a decompression limit
    #[error("could not decompress the body")]
    Decompression,

    /// Residual constraint violations from the compile handler
    #[error("policy could not be translated for this target")]
    Fragment(Vec<Value>),

    /// Policy compile failure
    #[error("{0}")]
    Compile(String),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Core library error
    #[error(transparent)]
    Core(#[from] gatehouse_core::Error),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::InvalidParameter(_) | Self::Decompression | Self::Compile(_) => {
                (StatusCode::BAD_REQUEST, "invalid_parameter")
            }
            Self::Fragment(_) => (StatusCode::BAD_REQUEST, "invalid_parameter"),
            Self::Store(StoreError::NotFound { .. } | StoreError::PolicyNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "resource_not_found")
            }
            Self::Store(StoreError::OwnershipViolation { .. }) => {
                (StatusCode::BAD_REQUEST, "invalid_parameter")
            }
            Self::Store(_) | Self::Core(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let mut body = json!({
            "code": code,
            "message": self.to_string(),
        });
        if let Self::Fragment(violations) = &self {
            body["errors"] = Value::Array(violations.clone());
        }
        (status, Json(body)).into_response()
    }
}

/// Server result type
pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn test_invalid_parameter_maps_to_400() {
        let response = ServerError::InvalidParameter("bad query".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_decompression_message() {
        let err = ServerError::Decompression;
        assert_eq!(err.to_string(), "could not decompress the body");
    }

    #[tokio::test]
    async fn test_ownership_violation_maps_to_400() {
        let err = ServerError::Store(StoreError::OwnershipViolation {
            path: "/plugins/users".to_string(),
            owner: "ldap.users".to_string(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
