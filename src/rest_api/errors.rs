//! # REST API Errors
//!
//! Error types for the REST API module. Every error renders as
//!
//! ```json
//! {"error": {"status": 404, "code": "NOT_FOUND", "message": "..."}}
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::model::ModelError;

/// Result type for REST operations
pub type RestResult<T> = Result<T, RestError>;

/// REST API errors
#[derive(Debug, Error)]
pub enum RestError {
    // ==================
    // Client Errors (4xx)
    // ==================
    /// Malformed `filter` or `where` query parameter
    #[error("Invalid query parameter {name}: {message}")]
    InvalidQueryParam { name: &'static str, message: String },

    /// Request body is not a JSON object
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    /// No public model is served under this path
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    // ==================
    // Auth Errors
    // ==================
    #[error("{0}")]
    Auth(#[from] AuthError),

    // ==================
    // Operation Errors
    // ==================
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl RestError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RestError::InvalidQueryParam { .. } | RestError::InvalidBody(_) => {
                StatusCode::BAD_REQUEST
            }
            RestError::UnknownCollection(_) => StatusCode::NOT_FOUND,
            RestError::Auth(AuthError::Unauthorized {
                authenticated: true,
                ..
            }) => StatusCode::FORBIDDEN,
            RestError::Auth(_) => StatusCode::UNAUTHORIZED,
            RestError::Model(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            RestError::InvalidQueryParam { .. } => "INVALID_FILTER",
            RestError::InvalidBody(_) => "INVALID_INPUT",
            RestError::UnknownCollection(_) => "NOT_FOUND",
            RestError::Auth(_) => "UNAUTHORIZED",
            RestError::Model(e) => e.code(),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
}

impl From<RestError> for ErrorResponse {
    fn from(err: RestError) -> Self {
        Self {
            error: ErrorBody {
                status: err.status_code().as_u16(),
                code: err.code(),
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let body = Json(ErrorResponse::from(self));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DatasourceError;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RestError::InvalidBody("test".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RestError::UnknownCollection("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RestError::from(ModelError::from(DatasourceError::Disconnected)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_auth_error_propagation() {
        let rest_err = RestError::from(AuthError::InvalidSignature);
        assert_eq!(rest_err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(rest_err.code(), "UNAUTHORIZED");
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorResponse::from(RestError::from(ModelError::NotFound {
            model: "Note".into(),
            id: "a".into(),
        }));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["status"], 404);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["message"], "Note a not found");
    }
}
