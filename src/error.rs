//! Error types shared across the scanning pipeline.
//!
//! Errors fall into a few broad categories:
//!
//! - **Configuration**: [`Error::Config`] - inconsistent registries or settings,
//!   detected at startup and never retried
//! - **Client**: [`Error::BadRequest`], [`Error::UnknownFormat`],
//!   [`Error::InvalidVersion`] - the caller asked for something we don't support
//! - **Infrastructure**: [`Error::Io`], [`Error::Download`]
//! - **Data**: [`Error::Parse`] - malformed metadata dumps
//! - **Execution**: [`Error::Extraction`], [`Error::Scan`], [`Error::NotBuilt`]
//!
//! A missing metadata record is never an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid registration or settings. Startup must not continue.
    #[error("configuration error: {0}")]
    Config(String),

    /// The request named something this process doesn't support.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No version parser is registered under the requested format.
    #[error("unknown version format: {0}")]
    UnknownFormat(String),

    /// A version string doesn't conform to its format's grammar.
    #[error("invalid version '{version}' for format {format}")]
    InvalidVersion { format: String, version: String },

    /// An extractor failed to read a layer.
    #[error("could not extract layer: {0}")]
    Extraction(String),

    /// A metadata document could not be decoded.
    #[error("could not parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("io error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not download {url}: {reason}")]
    Download { url: String, reason: String },

    /// The underlying inventory scan failed.
    #[error("inventory scan failed for node {node}: {reason}")]
    Scan { node: String, reason: String },

    /// A shared scan failed; every waiter receives the same error.
    #[error("{source} (shared by concurrent requests for {node})")]
    SharedScan {
        node: String,
        #[source]
        source: Arc<Error>,
    },

    /// `append` called on an appender whose cache hasn't been built.
    #[error("metadata cache for {0} has not been built")]
    NotBuilt(String),
}

impl Error {
    /// Wraps an I/O error together with the path that produced it.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Returns true for errors caused by the request rather than by the
    /// server. These are reported back as-is and never retried.
    pub fn is_client_error(&self) -> bool {
        match self {
            Error::BadRequest(_) | Error::UnknownFormat(_) | Error::InvalidVersion { .. } => true,
            Error::SharedScan { source, .. } => source.is_client_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_is_client_error() {
        let err = Error::BadRequest("unsupported image format \"oci\"".to_string());
        assert!(err.is_client_error());
        assert!(err.to_string().contains("oci"));
    }

    #[test]
    fn test_extraction_is_server_error() {
        let err = Error::Extraction("truncated archive".to_string());
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_unknown_format_display() {
        let err = Error::UnknownFormat("dpkg".to_string());
        assert_eq!(err.to_string(), "unknown version format: dpkg");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_io_error_display() {
        let err = Error::io(
            "/tmp/dump/nvd",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/dump/nvd"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_shared_scan_keeps_source() {
        let inner = Arc::new(Error::Scan {
            node: "node-a".to_string(),
            reason: "rpm database locked".to_string(),
        });
        let err = Error::SharedScan {
            node: "node-a".to_string(),
            source: inner,
        };
        assert!(err.to_string().contains("rpm database locked"));
        assert!(!err.is_client_error());
    }
}
