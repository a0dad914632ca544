//! Unified error handling for the server.

use crate::ledger::LedgerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use stockcount_sync::ErrorBody;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Ledger(LedgerError::UnknownSession(_) | LedgerError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Ledger(LedgerError::Invalid(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Ledger(LedgerError::Conflict { .. }) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::CONFLICT {
            tracing::warn!(error = %self, "Mutation conflicts with current state");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = match self {
            AppError::Ledger(LedgerError::Conflict { message, current }) => ErrorBody {
                error: message,
                current,
            },
            other => ErrorBody {
                error: other.to_string(),
                current: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
