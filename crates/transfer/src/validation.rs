use std::path::{Component, Path};

use crate::TransferError;

/// Maximum object key length accepted by common object stores.
const MAX_KEY_LEN: usize = 1024;

/// Validates a bucket name.
///
/// Rejects empty names, names containing path separators, and `.`/`..`.
pub fn validate_bucket_name(bucket: &str) -> Result<(), TransferError> {
    if bucket.is_empty() {
        return Err(TransferError::InvalidName("bucket name is empty".into()));
    }
    if bucket == "." || bucket == ".." {
        return Err(TransferError::InvalidName(format!(
            "bucket name not allowed: {bucket}"
        )));
    }
    if bucket.contains(['/', '\\']) || bucket.chars().any(char::is_control) {
        return Err(TransferError::InvalidName(format!(
            "bucket name contains invalid characters: {bucket}"
        )));
    }
    Ok(())
}

/// Validates that an object key stays inside its bucket.
///
/// Rejects:
/// - Empty keys and keys longer than 1024 bytes
/// - Absolute keys (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidName("object key is empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidName(format!(
            "object key longer than {MAX_KEY_LEN} bytes"
        )));
    }

    let path = Path::new(key);

    if path.is_absolute() {
        return Err(TransferError::InvalidName(format!(
            "absolute object key not allowed: {key}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidName(format!(
                    "parent directory traversal not allowed: {key}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidName(format!(
                    "absolute object key not allowed: {key}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
