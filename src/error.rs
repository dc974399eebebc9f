//! Error types for the file store

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::binary::BinaryId;

/// Store-wide result type
pub type Result<T> = std::result::Result<T, StoreError>;

/// File store error type
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Binary not found: {0}")]
    NotFound(String),

    #[error("Chunk conflict for {id}: {reason}")]
    ChunkConflict { id: BinaryId, reason: String },

    #[error("Metadata already exists for {0}")]
    DuplicateMetadata(BinaryId),

    #[error("Invalid binary id: {0:?}")]
    InvalidId(String),

    #[error("Invalid byte range {start}..{end:?} for object of {size} bytes")]
    InvalidRange {
        start: u64,
        end: Option<u64>,
        size: u64,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum computation failed: {0}")]
    Checksum(String),
}

impl StoreError {
    /// HTTP status an upload/download handler should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ChunkConflict { .. } => StatusCode::CONFLICT,
            Self::DuplicateMetadata(_) => StatusCode::CONFLICT,
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::InvalidRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Checksum(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::ChunkConflict { .. } => "CHUNK_CONFLICT",
            Self::DuplicateMetadata(_) => "DUPLICATE_METADATA",
            Self::InvalidId(_) => "INVALID_ID",
            Self::InvalidRange { .. } => "INVALID_RANGE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Checksum(_) => "CHECKSUM_ERROR",
        }
    }

    /// Whether the failure came from an unreachable or failing backend
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Database(_) | Self::Io(_))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Backend details stay in the log
        let message = if self.is_storage_failure() {
            tracing::error!(error = %self, "Storage failure");
            "Storage error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error: message,
            code: self.code(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct_for_conflict_and_storage() {
        let conflict = StoreError::ChunkConflict {
            id: BinaryId::new("abc").unwrap(),
            reason: "bytes differ".to_string(),
        };
        let storage = StoreError::Storage("bucket unreachable".to_string());

        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(storage.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(storage.is_storage_failure());
        assert!(!conflict.is_storage_failure());
    }

    #[test]
    fn test_into_response_uses_status_code() {
        let response = StoreError::NotFound("abc".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = StoreError::InvalidRange {
            start: 20,
            end: None,
            size: 10,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }
}
