//! Pointer generation for media files

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::SyncError;
use crate::mapper::PathMapper;
use crate::models::GenerateResult;

/// Writes one pointer file per media path, validating its content against
/// the mount prefix.
#[derive(Clone)]
pub struct PointerGenerator {
    mapper: Arc<dyn PathMapper>,
    mount_prefix: String,
}

impl PointerGenerator {
    pub fn new(mapper: Arc<dyn PathMapper>, mount_prefix: impl Into<String>) -> Self {
        Self {
            mapper,
            mount_prefix: mount_prefix.into(),
        }
    }

    /// Destination this generator would write for `media_path`
    pub fn destination(&self, media_path: &Path) -> PathBuf {
        self.mapper.to_mirror_path(media_path)
    }

    /// Generate the pointer for one media file.
    ///
    /// An existing destination is reported as skipped without being read.
    /// The mapper must be deterministic for that to hold.
    pub fn generate(&self, media_path: &Path, cancel: &CancelToken) -> GenerateResult {
        if cancel.is_cancelled() {
            return GenerateResult::failed(
                media_path.to_path_buf(),
                SyncError::cancelled(media_path),
            );
        }

        let dest = self.mapper.to_mirror_path(media_path);
        let content = self.mapper.to_pointer_content(media_path);

        if !validate_pointer_content(&content, &self.mount_prefix) {
            return GenerateResult::failed(
                dest.clone(),
                SyncError::mount_prefix(dest, &content, &self.mount_prefix),
            );
        }

        if let Some(dir) = dest.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                let err = SyncError::directory_create(dir, &e);
                return GenerateResult::failed(dest, err);
            }
        }

        if fs::metadata(&dest).is_ok() {
            log::trace!("Pointer exists, skipping {}", dest.display());
            return GenerateResult::skipped(dest);
        }

        if cancel.is_cancelled() {
            return GenerateResult::failed(dest, SyncError::cancelled(media_path));
        }

        match write_new(&dest, content.as_bytes()) {
            Ok(true) => {
                log::debug!("Wrote pointer {}", dest.display());
                GenerateResult::success(dest)
            }
            // Another consumer in this pass won the race.
            Ok(false) => GenerateResult::skipped(dest),
            Err(e) => {
                let err = SyncError::file_write(&dest, &e);
                GenerateResult::failed(dest, err)
            }
        }
    }
}

/// Create `path` exclusively and write `bytes`. Returns false if it already
/// existed. A partially written file is removed on failure.
fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == IoErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    if let Err(e) = file.write_all(bytes) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(true)
}

/// Read a pointer file back, trimmed.
pub fn read_pointer_content(path: &Path) -> std::io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// A pointer is valid when it resolves under the mount prefix.
pub fn validate_pointer_content(content: &str, mount_prefix: &str) -> bool {
    content.starts_with(mount_prefix)
}
