//! Error types for minivol

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Caller Errors ===
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    // === Cluster Errors ===
    #[error("Cluster member {member:?} is unavailable: {reason}")]
    RemoteUnavailable { member: String, reason: String },

    #[error("More than one cluster member has a volume named {0:?}")]
    AmbiguousLocation(String),

    #[error("Volume {0:?} has empty cluster member list")]
    EmptyLocation(String),

    // === Operation Errors ===
    #[error("Operation is not cancelable")]
    NotCancelable,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    // === Migration Errors ===
    #[error("Migration manifest mismatch: {0}")]
    ManifestMismatch(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Websocket error: {0}")]
    Websocket(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Conflict(_))
    }

    /// Shorthand for the "member unreachable" condition.
    pub fn unavailable(member: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::RemoteUnavailable {
            member: member.into(),
            reason: reason.to_string(),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidInput(_) | Error::InvalidConfig(_) | Error::NotCancelable => {
                StatusCode::BAD_REQUEST
            }
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::RemoteUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(e: axum::Error) -> Self {
        Error::Websocket(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Websocket(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::InvalidInput("bad".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Conflict("dup".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::PreconditionFailed("etag".into()).to_http_status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            Error::unavailable("node2", "connection refused").to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::AmbiguousLocation("vol".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_remote_unavailable_names_member() {
        let err = Error::unavailable("node2", "tls handshake failed");
        let msg = err.to_string();
        assert!(msg.contains("node2"));
        assert!(msg.contains("tls handshake failed"));
    }

    #[test]
    fn test_location_faults_are_distinct() {
        let ambiguous = Error::AmbiguousLocation("data".into()).to_string();
        let empty = Error::EmptyLocation("data".into()).to_string();
        assert!(ambiguous.contains("More than one cluster member"));
        assert!(empty.contains("empty cluster member list"));
    }
}
