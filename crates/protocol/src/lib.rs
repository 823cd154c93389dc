//! Wire types for the object gateway.
//!
//! These are the shapes the HTTP surface renders for upload control
//! operations. The engine produces them directly so every caller sees the
//! same JSON regardless of transport.

pub mod types;

pub use types::{ErrorBody, StartUploadResponse, UploadState, UploadStatus};
