//! Error types for the group cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the group cache.
///
/// Shard extraction problems never surface here: an entry with missing or
/// malformed attributes simply contributes nothing.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Unknown shard class, unknown cache, or an invalid setting
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stored content of a cache could not be decoded
    #[error("Cache '{cache}' is corrupt: {reason}")]
    CacheCorrupt { cache: String, reason: String },

    /// Read or write failure in the storage backend
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// Query against a cache that was never built
    #[error("Cache not ready: {0}")]
    StaleCache(String),

    /// Rebuild cancelled before promotion; previous content is intact
    #[error("Rebuild interrupted: {0}")]
    RebuildInterrupted(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Wraps any displayable failure as a corrupt-cache error for `cache`.
    pub fn corrupt(cache: &str, reason: impl std::fmt::Display) -> Self {
        CacheError::CacheCorrupt {
            cache: cache.to_string(),
            reason: reason.to_string(),
        }
    }
}

// == Backend Conversions ==
impl From<heed::Error> for CacheError {
    fn from(e: heed::Error) -> Self {
        CacheError::StorageIo(format!("lmdb: {}", e))
    }
}

impl From<sled::Error> for CacheError {
    fn from(e: sled::Error) -> Self {
        CacheError::StorageIo(format!("sled: {}", e))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::StorageIo(e.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::Configuration(_) => StatusCode::BAD_REQUEST,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::StaleCache(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::StorageIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::RebuildInterrupted(_) => StatusCode::CONFLICT,
            CacheError::CacheCorrupt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the group cache.
pub type Result<T> = std::result::Result<T, CacheError>;
