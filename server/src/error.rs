//! Error types for the supervisor

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::repair::RepairPhase;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the supervisor
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors (1100-1199)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Process errors (4000-4099)
    #[error("Process timeout: {0}")]
    Timeout(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Process crashed with exit code {exit_code:?}: {message}")]
    Crash {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("No dev server plan could be resolved for {0}")]
    PlanNotFound(String),

    // PTY errors (4100-4199)
    #[error("PTY not found: {0}")]
    PtyNotFound(String),

    #[error("PTY limit exceeded")]
    PtyLimitExceeded,

    // Repair errors (4200-4299)
    #[error("Repair session not found: {0}")]
    RepairNotFound(String),

    #[error("Invalid repair phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: RepairPhase, to: RepairPhase },

    // MCP session errors (4300-4399)
    #[error("MCP session not found: {0}")]
    McpSessionNotFound(String),

    // General errors (1000-1099)
    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            Error::Validation(_) => 1100,

            Error::Timeout(_) => 4002,
            Error::Spawn(_) => 4004,
            Error::Crash { .. } => 4005,
            Error::PlanNotFound(_) => 4007,

            Error::PtyNotFound(_) => 4101,
            Error::PtyLimitExceeded => 4102,

            Error::RepairNotFound(_) => 4201,
            Error::InvalidPhaseTransition { .. } => 4202,

            Error::McpSessionNotFound(_) => 4301,

            Error::InvalidParameter(_) => 1002,
            Error::OriginNotAllowed(_) => 1004,
            Error::Internal(_) => 1003,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::PlanNotFound(_)
            | Error::PtyNotFound(_)
            | Error::RepairNotFound(_)
            | Error::McpSessionNotFound(_) => StatusCode::NOT_FOUND,

            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,

            Error::InvalidParameter(_) => StatusCode::BAD_REQUEST,

            Error::OriginNotAllowed(_) => StatusCode::FORBIDDEN,

            Error::InvalidPhaseTransition { .. } => StatusCode::CONFLICT,

            Error::PtyLimitExceeded => StatusCode::TOO_MANY_REQUESTS,

            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,

            Error::Spawn(_) | Error::Crash { .. } | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
