//! Error types for the mirror

use std::path::PathBuf;
use thiserror::Error;

/// Error kinds that can occur while scanning or mirroring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller cancelled the operation
    Cancelled,
    /// A directory could not be listed; its subtree was abandoned
    DirectoryRead,
    /// Metadata for a single entry could not be fetched
    MetadataFetch,
    /// Pointer content does not start with the configured mount prefix
    MountPrefixViolation,
    /// Destination directory could not be created
    DirectoryCreate,
    /// Pointer file could not be written
    FileWrite,
    /// Auxiliary file could not be copied or flushed
    FileCopy,
    /// An orphan could not be removed
    Deletion,
    /// State store operation failed
    Database,
    /// Configuration is unusable
    InvalidConfig,
}

/// Represents an error that occurred while scanning or mirroring
#[derive(Debug, Error)]
#[error("{kind:?}: {message} (path: {path:?})")]
pub struct SyncError {
    /// The kind of error
    pub kind: ErrorKind,
    /// The path where the error occurred
    pub path: Option<PathBuf>,
    /// Human-readable error message
    pub message: String,
}

impl SyncError {
    /// Create a new error
    pub fn new(kind: ErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Operation aborted at the caller's request
    pub fn cancelled(path: impl Into<PathBuf>) -> Self {
        Self::new(ErrorKind::Cancelled, Some(path.into()), "operation cancelled")
    }

    pub fn directory_read(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        let message = format!("failed to read directory {}: {}", path.display(), err);
        Self::new(ErrorKind::DirectoryRead, Some(path), message)
    }

    pub fn metadata_fetch(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MetadataFetch, Some(path.into()), message)
    }

    /// Pointer content would not resolve under the mount
    pub fn mount_prefix(path: impl Into<PathBuf>, content: &str, prefix: &str) -> Self {
        Self::new(
            ErrorKind::MountPrefixViolation,
            Some(path.into()),
            format!("pointer content {content:?} does not start with mount prefix {prefix:?}"),
        )
    }

    pub fn directory_create(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        let message = format!("failed to create directory {}: {}", path.display(), err);
        Self::new(ErrorKind::DirectoryCreate, Some(path), message)
    }

    pub fn file_write(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        let message = format!("failed to write pointer file {}: {}", path.display(), err);
        Self::new(ErrorKind::FileWrite, Some(path), message)
    }

    pub fn file_copy(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileCopy, Some(path.into()), message)
    }

    pub fn deletion(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        let message = format!("failed to delete {}: {}", path.display(), err);
        Self::new(ErrorKind::Deletion, Some(path), message)
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, None, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, None, message)
    }

    /// Whether this error is the batch-wide stop signal
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_carry_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SyncError::directory_read("/media/a", &io);
        assert_eq!(err.kind, ErrorKind::DirectoryRead);
        assert_eq!(err.path, Some(PathBuf::from("/media/a")));
        assert!(err.message.contains("denied"));
    }

    #[test]
    fn test_cancelled() {
        let err = SyncError::cancelled("/media/movie.mkv");
        assert!(err.is_cancelled());
        assert!(!SyncError::database("boom").is_cancelled());
    }

    #[test]
    fn test_sqlite_errors_map_to_database() {
        let err: SyncError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.path.is_none());
    }

    #[test]
    fn test_mount_prefix_message() {
        let err = SyncError::mount_prefix("/out/a.strm", "/other/a.mkv", "/emby");
        assert_eq!(err.kind, ErrorKind::MountPrefixViolation);
        assert!(err.to_string().contains("/emby"));
    }
}
