//! Scanner module - walks the source tree and streams classified records
//!
//! The walk runs on its own thread and hands records over a bounded queue,
//! so a slow consumer applies backpressure instead of buffering the whole
//! tree. Per-directory failures go to a small best-effort error channel and
//! never stop the walk.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use walkdir::{DirEntry, WalkDir};

use crate::cancel::CancelToken;
use crate::config::{DEFAULT_ERROR_BUFFER, DEFAULT_RECORD_BUFFER};
use crate::error::SyncError;
use crate::models::{classify, FileKind, FileRecord, ScanResult};

/// How long a blocked emission waits before re-checking cancellation
const EMIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options for a single scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Skip directories and files last modified before this instant
    pub since: Option<DateTime<Utc>>,
    /// Capacity of the record queue
    pub record_buffer: usize,
    /// Capacity of the error side-channel
    pub error_buffer: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            since: None,
            record_buffer: DEFAULT_RECORD_BUFFER,
            error_buffer: DEFAULT_ERROR_BUFFER,
        }
    }
}

impl ScanOptions {
    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }
}

/// Counters describing the work one scan performed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Directories listed, root included
    pub dirs_visited: u64,
    /// Directories pruned by the `since` filter
    pub dirs_skipped: u64,
    /// Records handed to the consumer
    pub files_emitted: u64,
    /// Files dropped by the `since` filter
    pub files_skipped: u64,
    /// Per-entry metadata calls made
    pub metadata_fetches: u64,
    /// Errors delivered on the side-channel
    pub errors_reported: u64,
    /// Errors dropped because the side-channel was full
    pub errors_dropped: u64,
    /// The walk stopped early
    pub cancelled: bool,
}

/// A running scan: the record stream, the error side-channel and the
/// producer thread. Both receivers close when the walk finishes.
pub struct ScanHandle {
    pub records: Receiver<FileRecord>,
    pub errors: Receiver<SyncError>,
    worker: JoinHandle<ScanSummary>,
}

impl ScanHandle {
    /// Wait for the producer and return its counters.
    ///
    /// Both channels must be drained (or dropped) first, otherwise the
    /// producer may be parked on a full record queue.
    pub fn join(self) -> ScanSummary {
        let ScanHandle {
            records,
            errors,
            worker,
        } = self;
        drop(records);
        drop(errors);
        match worker.join() {
            Ok(summary) => summary,
            Err(_) => {
                log::error!("Scanner thread panicked");
                ScanSummary::default()
            }
        }
    }
}

/// Metadata is fetched when an incremental filter needs the mtime or
/// when the record is one consumers key off.
pub fn needs_metadata(since_active: bool, kind: FileKind) -> bool {
    since_active || kind.is_relevant()
}

/// Start scanning `root` with default buffer sizes.
pub fn scan(root: &Path, since: Option<DateTime<Utc>>, cancel: &CancelToken) -> ScanHandle {
    scan_with_options(root, ScanOptions::default().since(since), cancel)
}

/// Start scanning `root` on a background thread.
pub fn scan_with_options(root: &Path, options: ScanOptions, cancel: &CancelToken) -> ScanHandle {
    let (record_tx, records) = bounded(options.record_buffer.max(1));
    let (error_tx, errors) = bounded(options.error_buffer.max(1));

    let walker = Walker {
        since: options.since,
        records: record_tx,
        errors: error_tx,
        cancel: cancel.clone(),
        summary: ScanSummary::default(),
    };
    let root = root.to_path_buf();
    let worker = std::thread::spawn(move || walker.run(root));

    ScanHandle {
        records,
        errors,
        worker,
    }
}

/// Producer state. Dropping it closes both channels.
struct Walker {
    since: Option<DateTime<Utc>>,
    records: Sender<FileRecord>,
    errors: Sender<SyncError>,
    cancel: CancelToken,
    summary: ScanSummary,
}

impl Walker {
    fn run(mut self, root: PathBuf) -> ScanSummary {
        log::debug!("Scanning {} (since: {:?})", root.display(), self.since);

        let mut walker = WalkDir::new(&root)
            .follow_links(false)
            .min_depth(1)
            .into_iter();
        self.summary.dirs_visited += 1;

        loop {
            if self.cancel.is_cancelled() {
                self.summary.cancelled = true;
                break;
            }

            let entry = match walker.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| root.clone());
                    let io = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                    self.report(SyncError::directory_read(path, &io));
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if !self.enter_dir(&entry) {
                    walker.skip_current_dir();
                }
                continue;
            }

            if !self.visit_file(entry) {
                self.summary.cancelled = true;
                break;
            }
        }

        log::debug!("Scan of {} finished: {:?}", root.display(), self.summary);
        self.summary
    }

    /// Decide whether to descend into a directory.
    fn enter_dir(&mut self, entry: &DirEntry) -> bool {
        let Some(since) = self.since else {
            self.summary.dirs_visited += 1;
            return true;
        };

        match self.fetch_modified(entry) {
            Ok((Some(modified), _)) if modified < since => {
                // Relies on the store bumping directory mtimes when children change.
                log::trace!("Skipping unchanged directory {}", entry.path().display());
                self.summary.dirs_skipped += 1;
                false
            }
            Ok(_) => {
                self.summary.dirs_visited += 1;
                true
            }
            Err(err) => {
                self.report(err);
                false
            }
        }
    }

    /// Classify and emit one file. Returns false when the walk must stop.
    fn visit_file(&mut self, entry: DirEntry) -> bool {
        let kind = classify(entry.path());
        let since_active = self.since.is_some();

        let mut record = FileRecord::new(entry.path().to_path_buf(), kind);
        if needs_metadata(since_active, kind) {
            match self.fetch_modified(&entry) {
                Ok((modified, size)) => record = record.with_metadata(modified, size),
                Err(err) => {
                    self.report(err);
                    return true;
                }
            }
        }

        if let (Some(since), Some(modified)) = (self.since, record.modified_at) {
            if modified < since {
                self.summary.files_skipped += 1;
                return true;
            }
        }

        self.emit(record)
    }

    fn fetch_modified(&mut self, entry: &DirEntry) -> Result<(Option<DateTime<Utc>>, u64), SyncError> {
        self.summary.metadata_fetches += 1;
        let metadata = entry
            .metadata()
            .map_err(|e| SyncError::metadata_fetch(entry.path(), e.to_string()))?;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        Ok((modified, metadata.len()))
    }

    /// Blocking hand-off that gives up once cancelled or once the consumer
    /// has gone away.
    fn emit(&mut self, mut record: FileRecord) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match self.records.send_timeout(record, EMIT_POLL_INTERVAL) {
                Ok(()) => {
                    self.summary.files_emitted += 1;
                    return true;
                }
                Err(SendTimeoutError::Timeout(pending)) => record = pending,
                Err(SendTimeoutError::Disconnected(_)) => {
                    log::debug!("Record consumer went away, stopping scan");
                    return false;
                }
            }
        }
    }

    /// Best-effort error delivery: drop rather than block when full.
    fn report(&mut self, err: SyncError) {
        log::warn!("{}", err);
        match self.errors.try_send(err) {
            Ok(()) => self.summary.errors_reported += 1,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.summary.errors_dropped += 1;
            }
        }
    }
}

/// Run a scan to completion and tally the records by kind.
///
/// Errors are drained on a separate thread so neither channel can stall
/// the producer.
pub fn scan_and_collect(
    root: &Path,
    since: Option<DateTime<Utc>>,
    cancel: &CancelToken,
) -> (ScanResult, Vec<FileRecord>) {
    let handle = scan(root, since, cancel);

    let errors_rx = handle.errors.clone();
    let error_drain = std::thread::spawn(move || errors_rx.iter().collect::<Vec<_>>());

    let mut result = ScanResult::new();
    let mut files = Vec::new();
    for record in handle.records.iter() {
        result.counts.add(record.kind);
        files.push(record);
    }

    let summary = handle.join();
    log::debug!("Collected {} records ({:?})", files.len(), summary);
    result.errors = error_drain.join().unwrap_or_default();
    (result, files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn library() -> TempDir {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a/movie.mkv");
        touch(dir.path(), "a/poster.jpg");
        touch(dir.path(), "b/show.nfo");
        touch(dir.path(), "b/notes.txt");
        dir
    }

    fn run(root: &Path, since: Option<DateTime<Utc>>) -> (Vec<FileRecord>, Vec<SyncError>, ScanSummary) {
        let handle = scan(root, since, &CancelToken::new());
        let errors_rx = handle.errors.clone();
        let drain = std::thread::spawn(move || errors_rx.iter().collect::<Vec<_>>());
        let records: Vec<_> = handle.records.iter().collect();
        let summary = handle.join();
        (records, drain.join().unwrap(), summary)
    }

    #[test]
    fn test_needs_metadata_predicate() {
        assert!(needs_metadata(true, FileKind::Unknown));
        assert!(needs_metadata(true, FileKind::Media));
        assert!(needs_metadata(false, FileKind::Media));
        assert!(needs_metadata(false, FileKind::Image));
        assert!(!needs_metadata(false, FileKind::Unknown));
    }

    #[test]
    fn test_full_scan_emits_everything() {
        let dir = library();
        let (records, errors, summary) = run(dir.path(), None);

        assert!(errors.is_empty());
        assert_eq!(records.len(), 4);
        assert_eq!(summary.files_emitted, 4);
        assert_eq!(summary.dirs_visited, 3);
        assert_eq!(summary.dirs_skipped, 0);

        let movie = records
            .iter()
            .find(|r| r.path.ends_with("a/movie.mkv"))
            .unwrap();
        assert_eq!(movie.kind, FileKind::Media);
        assert!(movie.modified_at.is_some());
        assert_eq!(movie.size, 1);
    }

    #[test]
    fn test_unknown_files_skip_metadata_on_full_scan() {
        let dir = library();
        let (records, _, summary) = run(dir.path(), None);

        let notes = records
            .iter()
            .find(|r| r.path.ends_with("b/notes.txt"))
            .unwrap();
        assert_eq!(notes.kind, FileKind::Unknown);
        assert!(notes.modified_at.is_none());
        assert_eq!(notes.size, 0);
        // Three relevant files, no directory fetches without `since`.
        assert_eq!(summary.metadata_fetches, 3);
    }

    #[test]
    fn test_incremental_scan_populates_unknown_metadata() {
        let dir = library();
        let since = Utc::now() - ChronoDuration::hours(1);
        let (records, _, _) = run(dir.path(), Some(since));

        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.modified_at.is_some()));
    }

    #[test]
    fn test_since_in_future_skips_everything() {
        let dir = library();
        touch(dir.path(), "top.nfo");
        let since = Utc::now() + ChronoDuration::hours(1);
        let (records, errors, summary) = run(dir.path(), Some(since));

        assert!(records.is_empty());
        assert!(errors.is_empty());
        assert_eq!(summary.dirs_visited, 1);
        assert_eq!(summary.dirs_skipped, 2);
        assert_eq!(summary.files_skipped, 1);
    }

    #[test]
    fn test_cancelled_scan_closes_stream() {
        let dir = library();
        let cancel = CancelToken::new();
        cancel.cancel();
        let handle = scan(dir.path(), None, &cancel);
        let records: Vec<_> = handle.records.iter().collect();
        let summary = handle.join();

        assert!(records.is_empty());
        assert!(summary.cancelled);
    }

    #[test]
    fn test_cancel_unblocks_full_queue() {
        let dir = TempDir::new().unwrap();
        for i in 0..20 {
            touch(dir.path(), &format!("m{i}.mkv"));
        }
        let cancel = CancelToken::new();
        let options = ScanOptions {
            record_buffer: 1,
            ..Default::default()
        };
        let handle = scan_with_options(dir.path(), options, &cancel);

        // Take one record, leave the producer blocked, then cancel.
        assert!(handle.records.recv().is_ok());
        cancel.cancel();
        let summary = handle.join();
        assert!(summary.cancelled);
        assert!(summary.files_emitted < 20);
    }

    #[test]
    fn test_missing_root_reports_one_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let (records, errors, _) = run(&missing, None);

        assert!(records.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, crate::error::ErrorKind::DirectoryRead);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subdirectory_is_contained() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        for name in ["one", "two", "three"] {
            touch(dir.path(), &format!("{name}/episode.mkv"));
        }
        touch(dir.path(), "locked/hidden.mkv");
        let locked = dir.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users can still list the directory; nothing to test then.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let (records, errors, _) = run(dir.path(), None);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, crate::error::ErrorKind::DirectoryRead);
    }

    /// Build `root/name` as a directory chain whose deepest paths exceed
    /// PATH_MAX. Each step renames a short path, so creation itself never
    /// hits the limit.
    #[cfg(target_os = "linux")]
    fn overlong_chain(root: &Path, name: &str) {
        let segment = "d".repeat(200);
        let mut current = root.join("chain-0");
        fs::create_dir(&current).unwrap();
        for i in 1..25 {
            let next = root.join(format!("chain-{i}"));
            fs::create_dir(&next).unwrap();
            fs::rename(&current, next.join(&segment)).unwrap();
            current = next;
        }
        fs::rename(&current, root.join(name)).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unlistable_subtree_does_not_stop_siblings() {
        let dir = TempDir::new().unwrap();
        for name in ["one", "two", "three"] {
            touch(dir.path(), &format!("{name}/episode.mkv"));
        }
        overlong_chain(dir.path(), "deep");

        let (records, errors, _) = run(dir.path(), None);

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.kind == FileKind::Media));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, crate::error::ErrorKind::DirectoryRead);
        assert!(errors[0]
            .path
            .as_ref()
            .is_some_and(|p| p.starts_with(dir.path().join("deep"))));
    }

    #[test]
    fn test_error_channel_drops_when_full() {
        let dir = TempDir::new().unwrap();
        let (records, _records_rx) = bounded(1);
        let (errors, errors_rx) = bounded(1);
        // Nobody drains errors; the second report must not block.
        let mut walker = Walker {
            since: None,
            records,
            errors,
            cancel: CancelToken::new(),
            summary: ScanSummary::default(),
        };
        let io = std::io::Error::other("boom");
        walker.report(SyncError::directory_read(dir.path(), &io));
        walker.report(SyncError::directory_read(dir.path(), &io));
        assert_eq!(walker.summary.errors_reported, 1);
        assert_eq!(walker.summary.errors_dropped, 1);
        assert_eq!(errors_rx.len(), 1);
    }

    #[test]
    fn test_scan_and_collect_counts() {
        let dir = library();
        let (result, files) = scan_and_collect(dir.path(), None, &CancelToken::new());

        assert!(result.is_success());
        assert_eq!(files.len(), 4);
        assert_eq!(result.counts.media, 1);
        assert_eq!(result.counts.image, 1);
        assert_eq!(result.counts.metadata, 1);
        assert_eq!(result.counts.unknown, 1);
    }
}
