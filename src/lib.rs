//! Mirror a media library as lightweight pointer files
//!
//! The source tree (typically a slow remote mount) is walked once per pass.
//! Every media file gets a small `.strm` pointer in the mirror, metadata and
//! artwork are copied next to it, and mirror files whose source is gone are
//! removed on full passes.

pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod generator;
pub mod mapper;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod scanner;
pub mod syncer;

pub use cancel::CancelToken;
pub use config::SyncConfig;
pub use db::MirrorState;
pub use error::{ErrorKind, SyncError};
pub use generator::PointerGenerator;
pub use mapper::{PathMapper, StrmMapper};
pub use models::{
    classify, CopyResult, FileKind, FileRecord, GenerateResult, KindCounts, OpCounts, OpStatus,
    PathSet, ScanResult, SyncReport,
};
pub use pipeline::{audit_mirror, run_sync, MirrorAudit};
pub use progress::{ProgressReporter, SyncPhase};
pub use scanner::{scan, scan_and_collect, scan_with_options, ScanHandle, ScanOptions, ScanSummary};
pub use syncer::{delete_orphans, find_missing, find_orphans, list_mirror, CopySyncer};
