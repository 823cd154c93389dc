//! Part planning and payload access for multipart uploads.
//!
//! A payload of known size is split into fixed-size parts by [`plan`];
//! workers then pull exact byte ranges from an [`UploadSource`].

mod chunked;
mod source;
mod types;
mod validation;

pub use chunked::{checksum_bytes, chunk_count, md5_hex, pending_chunks, plan};
pub use source::{FileSource, MemorySource, ReadFuture, UploadSource};
pub use types::{ChunkDescriptor, CompletedPart, Fingerprint};
pub use validation::{validate_bucket_name, validate_object_key};

/// Default part size: 5 MiB, the smallest part most object stores accept.
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Upper bound on parts in one multipart transaction.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("part size must be greater than zero")]
    InvalidPartSize,

    #[error("{parts} parts exceed the limit of {MAX_PART_COUNT}, increase the part size")]
    TooManyParts { parts: u64 },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("range {start}..{end} is outside a source of {size} bytes")]
    OutOfRange { start: u64, end: u64, size: u64 },

    #[error("short read at offset {offset}: expected {expected} bytes, got {got}")]
    ShortRead {
        offset: u64,
        expected: usize,
        got: usize,
    },
}
