use std::error::Error;
use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::alerts::AlertError;
use crate::repository::StoreError;
use crate::sync::SyncError;

/// Unified application error.
///
/// Every layer (config, partner network, store, alert state machine)
/// collapses into one of these before reaching the binary or an HTTP
/// client.
#[derive(Debug)]
pub enum AppError {
    Config(String),
    Network(String),
    Parse(String),
    Unauthorized(String),
    Store(String),
    NotFound(String),
    Conflict(String),
    Unknown(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Store(_) | AppError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Parse(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Config error: {}", msg),
            AppError::Network(msg) => write!(f, "Network error: {}", msg),
            AppError::Parse(msg) => write!(f, "Parse error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Store(msg) => write!(f, "Store error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unknown(msg) => write!(f, "Unknown error: {}", msg),
        }
    }
}

impl Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Integrity { .. } => AppError::Conflict(err.to_string()),
            _ => AppError::Store(err.to_string()),
        }
    }
}

impl From<AlertError> for AppError {
    fn from(err: AlertError) -> Self {
        match err {
            AlertError::NotFound { .. } | AlertError::ExamNotFound { .. } => {
                AppError::NotFound(err.to_string())
            }
            AlertError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            AlertError::Store(store) => store.into(),
        }
    }
}

/// Only authorization failures escape a sync cycle; the partner is the
/// upstream that rejected us, so this is a gateway error.
impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        AppError::Network(err.to_string())
    }
}
