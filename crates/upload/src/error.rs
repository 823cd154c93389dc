//! Engine error types.

use objgate_protocol::ErrorBody;
use objgate_store::StoreError;

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload already exists: {0}")]
    AlreadyExists(String),

    #[error("part {part_number} failed: {reason}")]
    TransientPartFailure { part_number: u32, reason: String },

    #[error("checkpoint does not match the current source")]
    FingerprintMismatch,

    #[error("commit failed: {0}")]
    CommitFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl UploadError {
    /// Stable code for the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::InvalidConfiguration(_) => "invalid_configuration",
            UploadError::NotFound(_) => "not_found",
            UploadError::AlreadyExists(_) => "already_exists",
            UploadError::TransientPartFailure { .. } => "transient_part_failure",
            UploadError::FingerprintMismatch => "fingerprint_mismatch",
            UploadError::CommitFailure(_) => "commit_failure",
            UploadError::Io(_) => "io_error",
            UploadError::Store(_) => "store_error",
            UploadError::Cancelled => "cancelled",
            UploadError::Interrupted(_) => "interrupted",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}
