use axum::{
    extract::rejection::{BytesRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fence::ErrorKind;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Lease(#[from] fence::Error),

    #[error("lease {name:?} not found")]
    NotFound { name: String },

    /// An extractor refused the request. Keeps the extractor's status but
    /// not its text.
    #[error("{message}")]
    Rejected {
        status: StatusCode,
        message: &'static str,
    },
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            message: "malformed request path",
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            message: "malformed query string",
        }
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            message: "unreadable request body",
        }
    }
}

impl ApiError {
    /// - Malformed input: 400 Bad Request
    /// - Lease held, expired or fenced: 403 Forbidden
    /// - Unknown lease on read: 404 Not Found
    /// - Store failures: 500 Internal Server Error
    /// - Extractor rejections: whatever the extractor chose
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Lease(fence::Error::MalformedInput(_)) => StatusCode::BAD_REQUEST,
            ApiError::Lease(e) => match e.kind() {
                ErrorKind::ClientFault => StatusCode::FORBIDDEN,
                ErrorKind::ServerFault => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Rejected { status, .. } => *status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Backend details stay in the log
        let message = if status.is_server_error() {
            error!("Request failed: {}", self);
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
