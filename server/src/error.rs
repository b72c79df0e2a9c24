//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use larder_engine::ErrorKind;
use serde::Serialize;

use crate::store::StoreError;
use crate::sync::{LedgerError, SyncError};

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<larder_engine::Error> for AppError {
    fn from(err: larder_engine::Error) -> Self {
        AppError::Sync(err.into())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Sync(StoreError::from(err).into())
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn engine_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Transport | ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Sync(SyncError::Busy(_)) => StatusCode::CONFLICT,
            AppError::Sync(SyncError::LockTimeout(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Sync(SyncError::Engine(e)) => engine_status(e.kind()),
            AppError::Sync(SyncError::Ledger(LedgerError::Engine(e))) => engine_status(e.kind()),
            AppError::Sync(SyncError::Ledger(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Sync(SyncError::Store(StoreError::Unavailable(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Sync(SyncError::Store(StoreError::Backend(_))) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, details) = if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
            match &self {
                AppError::Sync(SyncError::LockTimeout(_)) => (self.to_string(), None),
                _ => ("Internal server error".to_string(), Some(self.to_string())),
            }
        } else {
            tracing::warn!("Request rejected: {}", self);
            (self.to_string(), None)
        };

        let body = Json(ErrorResponse { error, details });
        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
