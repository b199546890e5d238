use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use overdrop_engine::EngineError;
use serde_json::json;
use tracing::error;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidInput(msg) => ApiError::bad_request(msg),
            EngineError::NoDevices => {
                ApiError::bad_request("no devices matched the deployment target")
            }
            EngineError::NotFound => ApiError::not_found("not found"),
            EngineError::Conflict(msg) => ApiError::conflict(msg),
            EngineError::Upstream(msg) => {
                error!(cause = %msg, "upstream service failure");
                ApiError {
                    status: StatusCode::BAD_GATEWAY,
                    message: "upstream service unavailable".into(),
                }
            }
            // Scrub internal detail; the cause goes to the log only.
            EngineError::Internal(msg) => {
                error!(cause = %msg, "internal error");
                ApiError::internal("internal error")
            }
            EngineError::Cancelled => ApiError::internal("internal error"),
        }
    }
}
