//! Error types for the environment server

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the environment server
#[derive(Debug, Error)]
pub enum Error {
    // Environment errors (2000-2999)
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Version {0} not found")]
    VersionNotFound(u64),

    #[error("No persisted record for environment: {0}")]
    RecordNotFound(String),

    #[error(
        "Environment is locked, no updates allowed. Try to make do with the current environment \
         or ask a human to remove the lock file ({})",
        .0.display()
    )]
    EnvironmentLocked(PathBuf),

    // Validation errors (1000-1999)
    #[error("Invalid environment variable: {0}")]
    InvalidEnvVariable(String),

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Command errors (4000-4099)
    #[error("setup command failed with exit code {exit_code}.\nstdout: {stdout}\nstderr: {stderr}")]
    SetupCommandFailed {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    #[error("command failed with exit code {exit_code}.\nstdout: {stdout}\nstderr: {stderr}")]
    CommandFailed {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    // Infrastructure errors (6000-6999)
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("No free host port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    // General errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            // Validation errors (1000-1999)
            Error::InvalidEnvVariable(_) => 1001,
            Error::InvalidSecret(_) => 1002,
            Error::InvalidParameter(_) => 1003,

            // Environment errors (2000-2999)
            Error::EnvironmentNotFound(_) => 2001,
            Error::VersionNotFound(_) => 2002,
            Error::RecordNotFound(_) => 2003,
            Error::EnvironmentLocked(_) => 2004,

            // Command errors (4000-4099)
            Error::SetupCommandFailed { .. } => 4001,
            Error::CommandFailed { .. } => 4002,

            // Infrastructure errors (6000-6999)
            Error::Backend(_) => 6001,
            Error::Tunnel(_) => 6002,
            Error::PortExhausted { .. } => 6003,
            Error::Storage(_) => 6004,
            Error::Tracking(_) => 6005,

            Error::Cancelled => 9001,
            Error::Internal(_) => 9002,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::EnvironmentNotFound(_)
            | Error::VersionNotFound(_)
            | Error::RecordNotFound(_) => StatusCode::NOT_FOUND,

            Error::EnvironmentLocked(_) => StatusCode::LOCKED,

            Error::InvalidEnvVariable(_)
            | Error::InvalidSecret(_)
            | Error::InvalidParameter(_) => StatusCode::BAD_REQUEST,

            Error::SetupCommandFailed { .. } | Error::CommandFailed { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            Error::Backend(_) | Error::Tunnel(_) | Error::Storage(_) | Error::Tracking(_) => {
                StatusCode::BAD_GATEWAY
            }

            Error::PortExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // Client closed request
            Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),

            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error means "no such thing" rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EnvironmentNotFound(_) | Error::VersionNotFound(_) | Error::RecordNotFound(_)
        )
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

// Implement From for common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Backend(err.to_string())
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
