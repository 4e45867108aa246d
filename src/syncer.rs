//! Auxiliary file copying and mirror reconciliation

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::SyncError;
use crate::models::{classify, CopyResult, FileKind, PathSet, POINTER_EXTENSION};

/// Copy buffer size; large chunks amortize per-call latency on remote mounts
pub const COPY_BUFFER_SIZE: usize = 128 * 1024;

/// Copies metadata and image files into the mirror
#[derive(Debug, Clone)]
pub struct CopySyncer {
    buffer_size: usize,
}

impl Default for CopySyncer {
    fn default() -> Self {
        Self {
            buffer_size: COPY_BUFFER_SIZE,
        }
    }
}

impl CopySyncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Copy `src` to `dst` unless `dst` already exists.
    ///
    /// Existence alone decides the skip; contents are never compared.
    /// No partial or unflushed destination is left behind on failure.
    pub fn copy(&self, src: &Path, dst: &Path, cancel: &CancelToken) -> CopyResult {
        if cancel.is_cancelled() {
            return CopyResult::failed(src, dst, SyncError::cancelled(src));
        }

        if fs::metadata(dst).is_ok() {
            return CopyResult::skipped(src, dst);
        }

        if let Some(dir) = dst.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                return CopyResult::failed(src, dst, SyncError::directory_create(dir, &e));
            }
        }

        let mut reader = match File::open(src) {
            Ok(file) => file,
            Err(e) => {
                let err = SyncError::file_copy(src, format!("failed to open source file: {e}"));
                return CopyResult::failed(src, dst, err);
            }
        };

        if cancel.is_cancelled() {
            return CopyResult::failed(src, dst, SyncError::cancelled(src));
        }

        let mut writer = match OpenOptions::new().write(true).create_new(true).open(dst) {
            Ok(file) => file,
            // Another consumer in this pass created it first.
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                return CopyResult::skipped(src, dst);
            }
            Err(e) => {
                let err = SyncError::file_copy(dst, format!("failed to create destination file: {e}"));
                return CopyResult::failed(src, dst, err);
            }
        };

        if let Err(e) = self.stream(&mut reader, &mut writer) {
            drop(writer);
            let _ = fs::remove_file(dst);
            let err = SyncError::file_copy(dst, format!("failed to copy file content: {e}"));
            return CopyResult::failed(src, dst, err);
        }

        if let Err(e) = writer.sync_all() {
            drop(writer);
            let _ = fs::remove_file(dst);
            let err = SyncError::file_copy(dst, format!("failed to sync file: {e}"));
            return CopyResult::failed(src, dst, err);
        }

        log::debug!("Copied {} -> {}", src.display(), dst.display());
        CopyResult::success(src, dst)
    }

    fn stream(&self, reader: &mut File, writer: &mut File) -> std::io::Result<u64> {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            writer.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
}

/// Mirror paths with no current source: `existing \ current`, sorted.
pub fn find_orphans(existing: &PathSet, current: &PathSet) -> Vec<PathBuf> {
    let mut orphans: Vec<PathBuf> = existing.difference(current).cloned().collect();
    orphans.sort();
    orphans
}

/// Current sources with no mirror path: `current \ existing`, sorted.
pub fn find_missing(existing: &PathSet, current: &PathSet) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = current.difference(existing).cloned().collect();
    missing.sort();
    missing
}

/// Delete orphans, returning `(deleted, errors)`.
///
/// Already-absent files count as neither. Cancellation stops before the next
/// deletion and keeps what was already removed.
pub fn delete_orphans(orphans: &[PathBuf], cancel: &CancelToken) -> (usize, usize) {
    let mut deleted = 0;
    let mut errors = 0;
    for path in orphans {
        if cancel.is_cancelled() {
            log::info!("Orphan deletion cancelled after {} files", deleted);
            break;
        }

        match fs::remove_file(path) {
            Ok(()) => {
                log::debug!("Deleted orphan {}", path.display());
                deleted += 1;
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("{}", SyncError::deletion(path, &e));
                errors += 1;
            }
        }
    }
    (deleted, errors)
}

/// Whether a mirror file is one this tool produces.
pub fn is_mirror_file(path: &Path) -> bool {
    let is_pointer = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(POINTER_EXTENSION));
    is_pointer || matches!(classify(path), FileKind::Metadata | FileKind::Image)
}

/// Enumerate pointer and auxiliary files currently in the mirror.
///
/// An absent mirror is empty. Unreadable subtrees are logged and left out.
pub fn list_mirror(output_root: &Path) -> PathSet {
    let mut existing = PathSet::new();
    if !output_root.exists() {
        return existing;
    }

    for entry in WalkDir::new(output_root).follow_links(false) {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && is_mirror_file(entry.path()) {
                    existing.insert(entry.into_path());
                }
            }
            Err(e) => log::warn!("Failed to enumerate mirror: {}", e),
        }
    }
    existing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::OpStatus;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn set(paths: &[&str]) -> PathSet {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_copy_then_skip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("poster.jpg");
        let dst = dir.path().join("out/a/poster.jpg");
        fs::write(&src, vec![7u8; 300 * 1024]).unwrap();
        let syncer = CopySyncer::new();
        let cancel = CancelToken::new();

        let first = syncer.copy(&src, &dst, &cancel);
        assert_eq!(first.status, OpStatus::Success);
        assert_eq!(fs::read(&dst).unwrap(), fs::read(&src).unwrap());

        fs::write(&src, b"changed").unwrap();
        let second = syncer.copy(&src, &dst, &cancel);
        assert_eq!(second.status, OpStatus::Skipped);
        assert_eq!(fs::metadata(&dst).unwrap().len(), 300 * 1024);
    }

    #[test]
    fn test_copy_small_buffer() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("show.nfo");
        let dst = dir.path().join("mirror/show.nfo");
        fs::write(&src, b"<tvshow><title>x</title></tvshow>").unwrap();

        let result = CopySyncer::with_buffer_size(4).copy(&src, &dst, &CancelToken::new());
        assert_eq!(result.status, OpStatus::Success);
        assert_eq!(fs::read(&dst).unwrap(), fs::read(&src).unwrap());
    }

    #[test]
    fn test_copy_missing_source_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("gone.nfo");
        let dst = dir.path().join("out/gone.nfo");

        let result = CopySyncer::new().copy(&src, &dst, &CancelToken::new());
        assert_eq!(result.status, OpStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::FileCopy);
        assert!(!dst.exists());
    }

    #[test]
    fn test_copy_source_directory_removes_partial() {
        let dir = TempDir::new().unwrap();
        // Reading a directory fails after open on unix.
        let src = dir.path().join("folder.jpg");
        fs::create_dir(&src).unwrap();
        let dst = dir.path().join("out/folder.jpg");

        let result = CopySyncer::new().copy(&src, &dst, &CancelToken::new());
        assert_eq!(result.status, OpStatus::Failed);
        assert!(!dst.exists());
    }

    #[test]
    fn test_copy_cancelled() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("poster.jpg");
        fs::write(&src, b"img").unwrap();
        let dst = dir.path().join("out/poster.jpg");
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = CopySyncer::new().copy(&src, &dst, &cancel);
        assert_eq!(result.status, OpStatus::Failed);
        assert!(result.error.unwrap().is_cancelled());
        assert!(!dst.exists());
    }

    #[test]
    fn test_orphans_and_missing() {
        let existing = set(&["x.strm", "y.strm"]);
        let current = set(&["y.strm", "z.strm"]);
        assert_eq!(find_orphans(&existing, &current), vec![PathBuf::from("x.strm")]);
        assert_eq!(find_missing(&existing, &current), vec![PathBuf::from("z.strm")]);
    }

    #[test]
    fn test_delete_orphans() {
        let dir = TempDir::new().unwrap();
        let x = dir.path().join("x.strm");
        let y = dir.path().join("y.strm");
        fs::write(&x, "/emby/x.mkv").unwrap();
        fs::write(&y, "/emby/y.mkv").unwrap();

        let existing: PathSet = [x.clone(), y.clone()].into_iter().collect();
        let current: PathSet = [y.clone(), dir.path().join("z.strm")].into_iter().collect();
        let orphans = find_orphans(&existing, &current);

        assert_eq!(delete_orphans(&orphans, &CancelToken::new()), (1, 0));
        assert!(!x.exists());
        assert!(y.exists());
    }

    #[test]
    fn test_delete_absent_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let ghost = dir.path().join("ghost.strm");
        assert_eq!(delete_orphans(&[ghost], &CancelToken::new()), (0, 0));
    }

    #[test]
    fn test_delete_failure_counts_error() {
        let dir = TempDir::new().unwrap();
        // remove_file on a directory fails with something other than NotFound.
        let folder = dir.path().join("folder.strm");
        fs::create_dir(&folder).unwrap();
        let real = dir.path().join("real.strm");
        fs::write(&real, "x").unwrap();

        assert_eq!(delete_orphans(&[folder.clone(), real], &CancelToken::new()), (1, 1));
        assert!(folder.exists());
    }

    #[test]
    fn test_delete_cancelled_keeps_files() {
        let dir = TempDir::new().unwrap();
        let x = dir.path().join("x.strm");
        fs::write(&x, "x").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        assert_eq!(delete_orphans(&[x.clone()], &cancel), (0, 0));
        assert!(x.exists());
    }

    #[test]
    fn test_list_mirror() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("a/movie.strm"), "/emby/a/movie.mkv").unwrap();
        fs::write(root.join("a/poster.jpg"), "img").unwrap();
        fs::write(root.join("a/movie.nfo"), "nfo").unwrap();
        fs::write(root.join("a/desktop.ini"), "junk").unwrap();

        let existing = list_mirror(root);
        assert_eq!(existing.len(), 3);
        assert!(existing.contains(&root.join("a/movie.strm")));
        assert!(!existing.contains(&root.join("a/desktop.ini")));

        assert!(list_mirror(&root.join("absent")).is_empty());
    }

    proptest! {
        #[test]
        fn prop_set_difference_exact(
            e in prop::collection::hash_set("[a-e]{1,3}", 0..20),
            c in prop::collection::hash_set("[a-e]{1,3}", 0..20),
        ) {
            let existing: PathSet = e.iter().map(PathBuf::from).collect();
            let current: PathSet = c.iter().map(PathBuf::from).collect();

            let orphans: PathSet = find_orphans(&existing, &current).into_iter().collect();
            let missing: PathSet = find_missing(&existing, &current).into_iter().collect();

            for p in &orphans {
                prop_assert!(existing.contains(p) && !current.contains(p));
            }
            for p in &missing {
                prop_assert!(current.contains(p) && !existing.contains(p));
            }
            for p in &existing {
                prop_assert_eq!(orphans.contains(p), !current.contains(p));
            }
            for p in &current {
                prop_assert_eq!(missing.contains(p), !existing.contains(p));
            }

            prop_assert!(find_orphans(&existing, &existing).is_empty());
            prop_assert!(find_missing(&current, &current).is_empty());
            prop_assert_eq!(find_orphans(&existing, &PathSet::new()).len(), existing.len());
            prop_assert_eq!(find_missing(&PathSet::new(), &current).len(), current.len());
        }
    }
}
