//! Failure classification of the block-transfer stage

use crate::error::{Error, PcsError, remote_code};

/// Marker of a network failure caused by an oversized request body
const REQUEST_TOO_LARGE: &str = "413 Request Entity Too Large";

/// What to do after a failed multipart transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The upload session expired: drop the checkpoint, then retry
    ResetAndRetry,
    /// Transient fault: retry, keeping progress
    Retry,
    /// Retrying cannot help
    Terminal,
}

/// Classify an error returned by the multipart transfer
///
/// Errors that are not protocol errors, and protocol errors that could not be
/// decoded, are terminal.
pub fn classify(error: &Error) -> FailurePolicy {
    let Some(pcs) = error.as_protocol() else {
        return FailurePolicy::Terminal;
    };
    match pcs {
        PcsError::Remote { code, .. } => match *code {
            remote_code::BLOCK_MISS_IN_SUPERFILE => FailurePolicy::ResetAndRetry,
            remote_code::FILE_ALREADY_EXISTS => FailurePolicy::Terminal,
            _ => FailurePolicy::Retry,
        },
        PcsError::Network(message) if message.contains(REQUEST_TOO_LARGE) => {
            FailurePolicy::Terminal
        }
        PcsError::Network(_) => FailurePolicy::Retry,
        PcsError::Decode(_) => FailurePolicy::Terminal,
    }
}
