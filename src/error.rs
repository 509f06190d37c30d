//! Error types for pan-transfer
//!
//! Two layers are kept apart:
//! - [`PcsError`] is what the storage-protocol client reports (remote error
//!   codes, transport faults). Retry policy is derived from it.
//! - [`Error`] is the crate-wide error, wrapping protocol errors alongside
//!   local I/O, checkpoint and configuration failures.

use thiserror::Error;

/// Result type alias for pan-transfer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pan-transfer
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "upload.parallel")
        key: Option<String>,
    },

    /// Local I/O error (unreadable file, failed checkpoint write, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage protocol error
    #[error("{0}")]
    Protocol(#[from] PcsError),

    /// Checkpoint store error
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A task with this id is already in the group
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The protocol error wrapped by this error, if any
    pub fn as_protocol(&self) -> Option<&PcsError> {
        match self {
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Error reported by the storage-protocol client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcsError {
    /// The remote server rejected the request with an error code
    #[error("remote error {code}: {message}")]
    Remote {
        /// Remote error code (see [`remote_code`])
        code: i64,
        /// Message returned by the server
        message: String,
    },

    /// Transport-level failure (connect, timeout, HTTP status)
    #[error("network error: {0}")]
    Network(String),

    /// The response could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl PcsError {
    /// Create a remote error
    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        PcsError::Remote {
            code,
            message: message.into(),
        }
    }

    /// Remote error code, if this is a remote rejection
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            PcsError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Remote error codes the upload core reacts to
pub mod remote_code {
    /// File or directory does not exist
    pub const FILE_NOT_FOUND: i64 = 31066;
    /// A file with the same name already exists
    pub const FILE_ALREADY_EXISTS: i64 = 31061;
    /// Storage quota exceeded
    pub const EXCEED_QUOTA: i64 = 31112;
    /// Block missing in superfile: the upload session is stale
    pub const BLOCK_MISS_IN_SUPERFILE: i64 = 31363;
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_code_only_for_remote_errors() {
        assert_eq!(
            PcsError::remote(remote_code::EXCEED_QUOTA, "quota").remote_code(),
            Some(31112)
        );
        assert_eq!(PcsError::Network("reset".into()).remote_code(), None);
        assert_eq!(PcsError::Decode("bad json".into()).remote_code(), None);
    }

    #[test]
    fn protocol_error_display_is_transparent() {
        let err: Error = PcsError::remote(31061, "file already exists").into();
        assert_eq!(err.to_string(), "remote error 31061: file already exists");
        assert!(err.as_protocol().is_some());
    }

    #[test]
    fn io_error_is_not_protocol() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.as_protocol().is_none());
        assert!(err.to_string().starts_with("I/O error"));
    }
}
