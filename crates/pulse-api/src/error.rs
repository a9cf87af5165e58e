use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use pulse_types::error::CoreError;

/// REST-side wrapper for the core taxonomy: validation is the caller's
/// problem, unknown identities are 404, persistence failures are 500 and
/// get logged server-side.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::UnknownRecipient(_) => StatusCode::NOT_FOUND,
            CoreError::Persistence(e) => {
                error!("persistence failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(CoreError::Persistence(e))
    }
}
