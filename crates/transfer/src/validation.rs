use std::path::{Component, Path};

use crate::error::{UploadError, UploadResult};

/// Longest file name accepted, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Validates that a relative path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(path: &str) -> UploadResult<()> {
    if path.is_empty() {
        return Err(UploadError::InvalidMetadata("empty path".into()));
    }

    let p = Path::new(path);
    if p.is_absolute() {
        return Err(UploadError::InvalidMetadata(format!(
            "absolute path not allowed: {path}"
        )));
    }

    for component in p.components() {
        match component {
            Component::ParentDir => {
                return Err(UploadError::InvalidMetadata(format!(
                    "parent directory traversal not allowed: {path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(UploadError::InvalidMetadata(format!(
                    "absolute path not allowed: {path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Validates a single path segment: a file name or an owner id that ends up
/// in an artifact path.
///
/// Separators, `.`/`..`, control characters and names longer than
/// [`MAX_FILE_NAME_LEN`] bytes are rejected.
pub fn validate_file_name(name: &str) -> UploadResult<()> {
    if name.trim().is_empty() {
        return Err(UploadError::InvalidMetadata("file name is empty".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(UploadError::InvalidMetadata(format!(
            "file name longer than {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." {
        return Err(UploadError::InvalidMetadata(format!(
            "reserved file name: {name}"
        )));
    }
    if name.contains(['/', '\\']) {
        return Err(UploadError::InvalidMetadata(format!(
            "file name must not contain path separators: {name}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(UploadError::InvalidMetadata(
            "file name contains control characters".into(),
        ));
    }
    validate_relative_path(name)
}
