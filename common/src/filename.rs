//! Validation of file names received over the wire.
//!
//! Stored files are identified by a bare name relative to the destination root, so anything
//! that could make the joined path escape the root is rejected before the filesystem is touched.

pub const DEFAULT_MAX_NAME_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("file name is empty")]
    Empty,
    #[error("file name is {len} bytes long, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("file name {0:?} contains a NUL byte")]
    Nul(String),
    #[error("file name {0:?} contains a path separator")]
    Separator(String),
    #[error("file name {0:?} refers to the current or parent directory")]
    DotSegment(String),
}

/// Checks that `name` is a single plain path component.
///
/// Rejects absolute paths, `.`/`..`, any `/` or `\` separator, NUL bytes and names longer than
/// `max_len` bytes.
pub fn validate(name: &str, max_len: usize) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > max_len {
        return Err(NameError::TooLong {
            len: name.len(),
            max: max_len,
        });
    }
    if name.contains('\0') {
        return Err(NameError::Nul(name.to_string()));
    }
    // backslash is rejected everywhere so a name means the same thing regardless of host OS
    if name.contains('/') || name.contains('\\') {
        return Err(NameError::Separator(name.to_string()));
    }
    if name == "." || name == ".." {
        return Err(NameError::DotSegment(name.to_string()));
    }
    Ok(())
}

/// Joins a validated name onto the destination root.
pub fn destination_path(
    root: &std::path::Path,
    name: &str,
    max_len: usize,
) -> Result<std::path::PathBuf, NameError> {
    validate(name, max_len)?;
    Ok(root.join(name))
}
