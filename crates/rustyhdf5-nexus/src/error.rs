//! Error types for the NeXus tree API.

use crate::storage::StorageError;

/// Errors raised by tree, file and lock operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration value, file mode, class name or option.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The storage engine rejected an operation on `path`.
    #[error("cannot access '{path}' (mode {mode}): {message}")]
    StorageAccess {
        path: String,
        mode: String,
        message: String,
    },

    /// Attempt to modify a tree bound to a read-only file.
    #[error("{0}")]
    ReadOnlyViolation(String),

    /// Attempt to modify an item reached through a linked group.
    #[error("cannot modify an item in a linked group: {0}")]
    LinkedItemImmutable(String),

    /// Dereference of a link whose target cannot be found.
    #[error("cannot resolve the link to '{0}'")]
    BrokenLink(String),

    /// Attempt to write through an external link.
    #[error("cannot modify an externally linked item: {0}")]
    ReadOnlyLink(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("dtype mismatch: {0}")]
    DTypeMismatch(String),

    /// Whole-array access beyond the configured memory ceiling.
    #[error("use slabs to access data larger than NX_MEMORY={limit_mb} MB ({path})")]
    DataTooLarge { path: String, limit_mb: usize },

    /// Another process held the lock for longer than the timeout.
    #[error("'{0}' is currently locked by an external process")]
    LockTimeout(String),

    /// Two groups combined arithmetically do not share a structure.
    #[error("inconsistency between two {0} groups")]
    InconsistentGroups(String),

    /// Path lookup failed.
    #[error("'{0}' not found")]
    NotFound(String),

    /// Operation not valid for this node (e.g. assigning a root to a group).
    #[error("{0}")]
    InvalidOperation(String),
}

impl Error {
    /// Wrap a storage failure with the path and mode that were attempted.
    pub(crate) fn storage(path: impl Into<String>, mode: impl Into<String>, err: StorageError) -> Self {
        Error::StorageAccess {
            path: path.into(),
            mode: mode.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_access_carries_path_and_mode() {
        let err = Error::storage("/tmp/a.nxs", "rw", StorageError::NotFound("/entry".into()));
        let msg = err.to_string();
        assert!(msg.contains("/tmp/a.nxs"));
        assert!(msg.contains("rw"));
        assert!(msg.contains("/entry"));
    }

    #[test]
    fn data_too_large_mentions_slabs() {
        let err = Error::DataTooLarge {
            path: "/entry/data/counts".into(),
            limit_mb: 2000,
        };
        assert!(err.to_string().starts_with("use slabs"));
    }
}
