// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sapporo-wes.
//!
//! Every HTTP-visible failure maps onto the uniform `ErrorResponse` body.
//! Supervisor failures after fork are deliberately not representable here:
//! they are recorded in the run's `system_logs.json` and surface through the
//! run's terminal state.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::schemas::ErrorResponse;

/// Service errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    /// Request validation failed.
    #[error("{0}")]
    InvalidRequest(String),

    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthenticated(String),

    /// Authenticated but not allowed. Also returned for nonexistent runs
    /// when auth is enabled, so ownership checks never leak run existence.
    #[error("{0}")]
    Forbidden(String),

    /// Resource does not exist (auth-disabled deployments only, for runs).
    #[error("{0}")]
    NotFound(String),

    /// The request races with the run's current state (e.g. double-cancel
    /// transition rejected by the state machine).
    #[error("{0}")]
    Conflict(String),

    /// Endpoint exists in the protocol but not in this implementation.
    #[error("{0}")]
    Unsupported(String),

    /// Local filesystem operation failed.
    #[error("storage error: {0}")]
    StorageIo(#[from] std::io::Error),

    /// Index (SQLite) operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The external IdP could not be reached after retries.
    #[error("identity provider unavailable: {0}")]
    Upstream(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

/// Result type using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) | AppError::Unsupported(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::StorageIo(_)
            | AppError::Database(_)
            | AppError::Json(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message exposed to clients. Internal failures are not echoed verbatim;
    /// the detail goes to the log instead.
    fn client_msg(&self) -> String {
        match self {
            AppError::StorageIo(_) | AppError::Database(_) | AppError::Json(_) => {
                "the server encountered an internal error and was unable to complete your request"
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            msg: self.client_msg(),
            status_code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
