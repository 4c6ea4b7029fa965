//! Error handling module
//!
//! Provides unified error types for the snapshot engine and its HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// A source column type that neither the standard mapping, the named-type
    /// catalog nor the override table can resolve.
    #[error("Unknown column type {code} ({type_name}) at {table}.{column}")]
    UnknownType {
        table: String,
        column: String,
        code: i32,
        type_name: String,
    },

    #[error("Table {table} has {found} snapshot version(s), {required} required")]
    NoVersion {
        table: String,
        required: usize,
        found: usize,
    },

    #[error("Version allocation failed: {0}")]
    VersionAllocation(#[source] rusqlite::Error),

    #[error("Snapshot of {table} failed: {source}")]
    Snapshot {
        table: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Local store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wrap an error with the name of the table being captured.
    pub fn snapshot(table: impl Into<String>, source: AppError) -> Self {
        match source {
            // already carries table context
            AppError::Snapshot { .. } => source,
            other => AppError::Snapshot {
                table: table.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through `Snapshot` wrappers.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Snapshot { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias used across the crate
pub type AppResult<T> = Result<T, AppError>;

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self.root() {
            AppError::UnknownType { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UNKNOWN_TYPE",
                self.to_string(),
                None,
            ),
            AppError::NoVersion { .. } => (
                StatusCode::CONFLICT,
                "NO_VERSION",
                self.to_string(),
                None,
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "POOL_EXHAUSTED",
                    "Source connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Database(_) | AppError::Sqlite(_) | AppError::VersionAllocation(_) => {
                error!("Database error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    Some(self.to_string()),
                )
            }
            _ => {
                error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(self.to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_wrapping_is_not_nested() {
        let inner = AppError::NotFound("emp".to_string());
        let wrapped = AppError::snapshot("EMP", inner);
        let rewrapped = AppError::snapshot("OTHER", wrapped);

        match &rewrapped {
            AppError::Snapshot { table, .. } => assert_eq!(table, "EMP"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rewrapped.root(), AppError::NotFound(_)));
    }

    #[test]
    fn no_version_maps_to_conflict() {
        let err = AppError::NoVersion {
            table: "emp".to_string(),
            required: 2,
            found: 1,
        };
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
