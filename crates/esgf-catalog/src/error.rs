//! Error types for the catalog client.
//!
//! A single enum covers every failure surfaced to users, from search-time
//! problems (no results, unknown project) through download-time problems
//! (stalled links, checksum mismatches) to bulk-transfer task failures.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for catalog operations.
#[derive(Debug, Error)]
pub enum EsgfError {
    // Search errors
    #[error("Search returned no results")]
    NoSearchResults,

    #[error("The '{0}' project is not supported")]
    UnknownProject(String),

    #[error("Queries may not span projects, found: {0:?}")]
    MixedProjects(Vec<String>),

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("{url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    // File access errors
    #[error("No write permission in any cache directory: {0:?}")]
    LocalCacheNotWritable(Vec<PathBuf>),

    #[error("Unable to find file information for keys: {0:?}")]
    MissingFileInfo(Vec<String>),

    #[error("The reader failed to open datasets for keys: {0:?}")]
    DatasetInitError(Vec<String>),

    // Download errors
    #[error("Download of {url} stalled at {rate:.2} Mb/s (threshold {threshold:.2})")]
    StalledDownload {
        url: String,
        rate: f64,
        threshold: f64,
    },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    // Bulk transfer errors
    #[error("Bulk transfer task {task_id} ended without success: {detail}")]
    BulkTransferError { task_id: String, detail: String },

    #[error("Bulk endpoint is not reachable: {0}")]
    EndpointNotAlive(String),

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{operation} is not supported by {driver}")]
    Unsupported { driver: String, operation: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, EsgfError>;

impl From<std::io::Error> for EsgfError {
    fn from(err: std::io::Error) -> Self {
        EsgfError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for EsgfError {
    fn from(err: serde_json::Error) -> Self {
        EsgfError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for EsgfError {
    fn from(err: rusqlite::Error) -> Self {
        EsgfError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for EsgfError {
    fn from(err: reqwest::Error) -> Self {
        EsgfError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl EsgfError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        EsgfError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error is a per-driver transport failure.
    ///
    /// Transport failures are absorbed during federation: the failing driver
    /// contributes an empty frame and a warning rather than aborting the
    /// whole search.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EsgfError::Network { .. } | EsgfError::HttpStatus { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EsgfError::UnknownProject("cmip9".into());
        assert_eq!(err.to_string(), "The 'cmip9' project is not supported");
    }

    #[test]
    fn test_transport_classification() {
        assert!(EsgfError::HttpStatus {
            url: "https://example.org".into(),
            status: 503
        }
        .is_transport());
        assert!(!EsgfError::NoSearchResults.is_transport());
        assert!(!EsgfError::MixedProjects(vec!["CMIP5".into(), "CMIP6".into()]).is_transport());
    }
}
