// crates/bingo-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::player::PlayerError;
use crate::state::StateError;
use crate::validation::ValidationError;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Room state is not loaded yet")]
    NotReady,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Player(#[from] PlayerError),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) | AppError::Validation(_) | AppError::Json(_) => {
                StatusCode::BAD_REQUEST
            },
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            AppError::State(_) | AppError::Player(_) => StatusCode::CONFLICT,
            AppError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "INT_001",
            AppError::NotFound(_) => "NF_001",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Http(_) => "HTTP_001",
            AppError::InvalidInput(_) => "VAL_001",
            AppError::Validation(_) => "VAL_002",
            AppError::Channel(_) => "CHAN_001",
            AppError::Timeout(_) => "TIME_001",
            AppError::NotReady => "ROOM_002",
            AppError::State(_) => "ROOM_003",
            AppError::Player(_) => "CARD_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Internal(_) | AppError::Io(_) => "An internal server error occurred".to_string(),
            AppError::Json(_) => "Invalid request format".to_string(),
            AppError::Http(_) => "Upstream request failed".to_string(),
            AppError::NotFound(_) => "Resource not found".to_string(),
            AppError::InvalidInput(_) | AppError::Validation(_) => "Invalid input provided".to_string(),
            AppError::Channel(_) => "Channel unavailable".to_string(),
            AppError::Timeout(_) => "Upstream timed out".to_string(),
            // these carry no internals and read fine as-is
            AppError::NotReady | AppError::State(_) | AppError::Player(_) => {
                self.to_string()
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Channel("Failed to send message".to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AppError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        AppError::Channel("Actor stopped before replying".to_string())
    }
}
