use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::core::errors::FlowError;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Flow(FlowError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        ApiError::Flow(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Flow(err) => {
                let status = match &err {
                    FlowError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
                    FlowError::InstanceAlreadyExists { .. } => StatusCode::CONFLICT,
                    FlowError::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
                    FlowError::QueueFull { .. } | FlowError::Shutdown => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    FlowError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => {
                        tracing::error!("Engine error: {:?}", err);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.category(), err.to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
