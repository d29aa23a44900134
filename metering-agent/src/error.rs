use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ledger_client::StorageError;

use crate::validation::ValidationError;

/// Failures surfaced at the HTTP boundary. Delivery problems on the
/// outbound path are not errors here; they come back as data.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Missing signature")]
    MissingSignature,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    BadQuery(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSignature => StatusCode::FORBIDDEN,
            Self::MissingSignature => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadQuery(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = match &self {
            Self::Storage(e) => {
                tracing::error!(error = %e, "ledger storage failure");
                "ledger unavailable".to_string()
            }
            other => other.to_string(),
        };

        (self.status(), Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}
