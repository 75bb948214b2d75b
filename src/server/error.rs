/// HTTP mapping of [`ProofError`].
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ProofError;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error: a [`ProofError`] rendered with its HTTP status.
#[derive(Debug)]
pub struct ApiError(pub ProofError);

impl From<ProofError> for ApiError {
    fn from(err: ProofError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ProofError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProofError::Generation(_) => StatusCode::BAD_GATEWAY,
            ProofError::NotFound(_) => StatusCode::NOT_FOUND,
            ProofError::Chain(_) | ProofError::Ledger(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
