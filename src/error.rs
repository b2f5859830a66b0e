use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error kinds per the core's error handling design: a closed set of
/// classifications the Supervisor reacts to, not a grab-bag of exception types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid configuration [{field}]: {message}")]
    ConfigInvalid { field: String, message: String },

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Classification used by the Supervisor's retry logic (§4.1, §7).
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::Auth(_) | AppError::ConfigInvalid { .. })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ConfigInvalid { .. } => StatusCode::BAD_REQUEST,
            AppError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Protocol(e.to_string())
    }
}

impl From<rumqttc::ClientError> for AppError {
    fn from(e: rumqttc::ClientError) -> Self {
        AppError::Network(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        AppError::Timeout(e.to_string())
    }
}

/// Unified response envelope — matches the style used across the HTTP front-end
/// and the IPC server: `success` carries the outcome, `message` is for humans.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AppError>;
