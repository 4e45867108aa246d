//! Core data models for the mirror

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Extensions of media files that get a pointer instead of a copy
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "m2ts", "mts", "rmvb", "rm",
    "mpg", "mpeg", "vob", "iso", "3gp",
];

/// Extensions of metadata and subtitle files that are copied
pub const METADATA_EXTENSIONS: &[&str] = &[
    "nfo", "srt", "ass", "ssa", "sub", "idx", "vtt", "sup", "xml",
];

/// Extensions of artwork that is copied
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tbn"];

/// Extension given to pointer files
pub const POINTER_EXTENSION: &str = "strm";

/// A set of paths, compared by membership only
pub type PathSet = HashSet<PathBuf>;

/// File classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Video files that are mirrored as pointers
    Media,
    /// Sidecar metadata (nfo, subtitles)
    Metadata,
    /// Posters, fanart and thumbnails
    Image,
    /// Anything else
    Unknown,
}

impl FileKind {
    /// Infer the kind from a file extension (without dot)
    pub fn from_extension(ext: &str) -> Self {
        let ext_lower = ext.to_lowercase();
        let ext = ext_lower.as_str();
        if ext.is_empty() {
            FileKind::Unknown
        } else if MEDIA_EXTENSIONS.contains(&ext) {
            FileKind::Media
        } else if METADATA_EXTENSIONS.contains(&ext) {
            FileKind::Metadata
        } else if IMAGE_EXTENSIONS.contains(&ext) {
            FileKind::Image
        } else {
            FileKind::Unknown
        }
    }

    /// Whether downstream stages mirror files of this kind
    pub fn is_relevant(&self) -> bool {
        !matches!(self, FileKind::Unknown)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Media => "media",
            FileKind::Metadata => "metadata",
            FileKind::Image => "image",
            FileKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "media" => FileKind::Media,
            "metadata" => FileKind::Metadata,
            "image" => FileKind::Image,
            _ => FileKind::Unknown,
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify a path by its extension, case-insensitively.
/// Paths without an extension are `Unknown`.
pub fn classify(path: &Path) -> FileKind {
    path.extension()
        .and_then(|e| e.to_str())
        .map(FileKind::from_extension)
        .unwrap_or(FileKind::Unknown)
}

/// One observed filesystem entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Full path to the file
    pub path: PathBuf,
    /// Classification by extension
    pub kind: FileKind,
    /// Modification time; `None` when the scanner elided the metadata fetch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    /// File size in bytes; zero when elided
    pub size: u64,
}

impl FileRecord {
    pub fn new(path: PathBuf, kind: FileKind) -> Self {
        Self {
            path,
            kind,
            modified_at: None,
            size: 0,
        }
    }

    /// Attach fetched metadata
    pub fn with_metadata(mut self, modified_at: Option<DateTime<Utc>>, size: u64) -> Self {
        self.modified_at = modified_at;
        self.size = size;
        self
    }
}

/// Outcome of a single destination-producing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    /// The destination was written
    Success,
    /// The destination already existed
    Skipped,
    /// The attempt failed; see the attached error
    Failed,
}

/// Result of generating one pointer file
#[derive(Debug)]
pub struct GenerateResult {
    /// Destination pointer path, or the media path when the mapper was never consulted
    pub path: PathBuf,
    pub status: OpStatus,
    pub error: Option<SyncError>,
}

impl GenerateResult {
    pub fn success(path: PathBuf) -> Self {
        Self {
            path,
            status: OpStatus::Success,
            error: None,
        }
    }

    pub fn skipped(path: PathBuf) -> Self {
        Self {
            path,
            status: OpStatus::Skipped,
            error: None,
        }
    }

    pub fn failed(path: PathBuf, error: SyncError) -> Self {
        Self {
            path,
            status: OpStatus::Failed,
            error: Some(error),
        }
    }
}

/// Result of copying one auxiliary file
#[derive(Debug)]
pub struct CopyResult {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub status: OpStatus,
    pub error: Option<SyncError>,
}

impl CopyResult {
    fn with_status(src: &Path, dst: &Path, status: OpStatus, error: Option<SyncError>) -> Self {
        Self {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            status,
            error,
        }
    }

    pub fn success(src: &Path, dst: &Path) -> Self {
        Self::with_status(src, dst, OpStatus::Success, None)
    }

    pub fn skipped(src: &Path, dst: &Path) -> Self {
        Self::with_status(src, dst, OpStatus::Skipped, None)
    }

    pub fn failed(src: &Path, dst: &Path, error: SyncError) -> Self {
        Self::with_status(src, dst, OpStatus::Failed, Some(error))
    }
}

/// Per-kind tally of scanned files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub media: u64,
    pub metadata: u64,
    pub image: u64,
    pub unknown: u64,
}

impl KindCounts {
    pub fn add(&mut self, kind: FileKind) {
        match kind {
            FileKind::Media => self.media += 1,
            FileKind::Metadata => self.metadata += 1,
            FileKind::Image => self.image += 1,
            FileKind::Unknown => self.unknown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.media + self.metadata + self.image + self.unknown
    }
}

/// Per-status tally of generate or copy operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounts {
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl OpCounts {
    pub fn add(&mut self, status: OpStatus) {
        match status {
            OpStatus::Success => self.success += 1,
            OpStatus::Skipped => self.skipped += 1,
            OpStatus::Failed => self.failed += 1,
        }
    }
}

/// Aggregated result of a scan
#[derive(Debug, Default)]
pub struct ScanResult {
    pub counts: KindCounts,
    /// Errors reported on the side-channel
    pub errors: Vec<SyncError>,
}

impl ScanResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Check if the scan completed without errors
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of one full mirror pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Files seen by the scanner, by kind
    pub counts: KindCounts,
    /// Pointer generation outcomes
    pub pointers: OpCounts,
    /// Metadata/image copy outcomes
    pub copies: OpCounts,
    /// Mirror files with no current source
    pub orphans: u64,
    /// Current sources still without a mirror file after this pass
    pub missing: u64,
    pub deleted: u64,
    pub delete_errors: u64,
    /// Number of scan errors (directory reads, metadata fetches)
    pub scan_errors: u64,
    /// Messages of every failed operation and scan error
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
    pub incremental: bool,
    pub cancelled: bool,
    /// Total pass duration in milliseconds
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.scan_errors == 0
            && self.pointers.failed == 0
            && self.copies.failed == 0
            && self.delete_errors == 0
    }
}
