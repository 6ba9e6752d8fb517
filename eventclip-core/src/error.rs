//! Crate-wide error types.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Timed out after {timeout_ms}ms waiting for job {id}")]
    Timeout { id: String, timeout_ms: u64 },

    #[error("Job {id} was cancelled")]
    Cancelled { id: String },

    #[error("Failed to fetch video {video_id}: {reason}")]
    Fetch { video_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    pub fn fetch(video_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            video_id: video_id.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a caller could reasonably try the same operation again.
    ///
    /// Nothing in this crate retries on its own; this is a hint for callers
    /// that create a fresh job or re-request a video.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upload(_) | Self::Fetch { .. } | Self::Http(_) | Self::Io(_) | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("UploadJob", "J1");
        assert_eq!(err.to_string(), "Entity not found: UploadJob with id J1");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::upload("socket closed").is_retryable());
        assert!(Error::fetch("v1", "404").is_retryable());
        assert!(!Error::validation("empty uri").is_retryable());
        assert!(!Error::Cancelled { id: "J1".into() }.is_retryable());
    }
}
