//! Progress reporting module for mirror passes
//!
//! This module provides data structures and utilities for reporting
//! progress to external callers as JSON lines on stderr.

use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{KindCounts, SyncReport};

/// Pass phase indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Scanning the source and writing the mirror
    #[default]
    Scan,
    /// Diffing and cleaning the mirror
    Reconcile,
}

/// Start message sent when a pass begins
#[derive(Debug, Clone, Serialize)]
pub struct StartMessage {
    /// Message type identifier
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    pub source: String,
    pub output: String,
    pub mount: String,
    pub incremental: bool,
    /// Threshold of an incremental pass, RFC 3339
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

/// Progress message sent during a pass
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    /// Message type identifier ("p" for progress)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    /// Current phase
    pub phase: SyncPhase,
    /// Number of media files seen
    #[serde(rename = "m")]
    pub media: u64,
    /// Number of metadata files seen
    #[serde(rename = "n")]
    pub metadata: u64,
    /// Number of image files seen
    #[serde(rename = "i")]
    pub image: u64,
    /// Number of unknown files seen
    #[serde(rename = "u")]
    pub unknown: u64,
    /// Files written into the mirror so far
    #[serde(rename = "w")]
    pub written: u64,
}

/// Error message sent when an item fails
#[derive(Debug, Clone, Serialize)]
pub struct ErrorProgressMessage {
    /// Message type identifier ("err" for error)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    /// Error type/category
    pub error_type: String,
    /// Error message description
    pub message: String,
    /// Path that caused the error (if available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Done message sent when a pass completes
#[derive(Debug, Clone, Serialize)]
pub struct DoneMessage {
    /// Message type identifier ("done" for completion)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    /// Pointers written
    #[serde(rename = "pw")]
    pub pointers_written: u64,
    /// Auxiliary files copied
    #[serde(rename = "cw")]
    pub copies_written: u64,
    /// Orphans deleted
    #[serde(rename = "od")]
    pub orphans_deleted: u64,
    /// Missing entries at reconcile time
    #[serde(rename = "mi")]
    pub missing: u64,
    /// Number of errors encountered
    #[serde(rename = "ec")]
    pub error_count: u64,
    pub cancelled: bool,
    /// Total pass duration in milliseconds
    pub ms: u64,
}

/// Progress reporter for outputting pass progress to stderr
///
/// Shared by all consumer threads; sequence numbers stay monotonic across them.
pub struct ProgressReporter {
    /// Whether progress reporting is enabled
    enabled: bool,
    /// Reporting interval in milliseconds
    interval_ms: u64,
    /// Last report time
    last_report: Mutex<Instant>,
    /// Sequence number for messages
    seq: AtomicU64,
    /// Start time of the reporter
    start_time: Instant,
}

impl ProgressReporter {
    /// Create a new ProgressReporter
    ///
    /// # Arguments
    /// * `enabled` - Whether progress reporting is enabled
    /// * `interval_ms` - Minimum interval between progress messages in milliseconds
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            interval_ms,
            last_report: Mutex::new(now),
            seq: AtomicU64::new(0),
            start_time: now,
        }
    }

    /// Claim the current reporting slot if the interval has elapsed.
    fn take_slot(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let Ok(mut last) = self.last_report.lock() else {
            return false;
        };
        if last.elapsed().as_millis() as u64 >= self.interval_ms {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Get the next sequence number (monotonically increasing)
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Get the current timestamp in milliseconds since reporter creation
    pub fn current_timestamp(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Output a serializable message to stderr as JSON
    fn output_to_stderr<T: Serialize>(&self, msg: &T) {
        if let Ok(json) = serde_json::to_string(msg) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", json);
            let _ = stderr.flush();
        }
    }

    /// Report pass start
    pub fn report_start(&self, config: &SyncConfig, since: Option<chrono::DateTime<chrono::Utc>>) {
        if !self.enabled {
            return;
        }

        let msg = StartMessage {
            msg_type: "start",
            seq: self.next_seq(),
            ts: self.current_timestamp(),
            source: config.source_root.to_string_lossy().to_string(),
            output: config.output_root.to_string_lossy().to_string(),
            mount: config.mount_prefix.clone(),
            incremental: config.incremental,
            since: since.map(|t| t.to_rfc3339()),
        };
        self.output_to_stderr(&msg);
    }

    /// Report progress, rate-limited by the interval.
    /// Returns true if a message was actually sent.
    pub fn report_progress(&self, phase: SyncPhase, counts: &KindCounts, written: u64) -> bool {
        if !self.take_slot() {
            return false;
        }

        let msg = ProgressMessage {
            msg_type: "p",
            seq: self.next_seq(),
            ts: self.current_timestamp(),
            phase,
            media: counts.media,
            metadata: counts.metadata,
            image: counts.image,
            unknown: counts.unknown,
            written,
        };
        self.output_to_stderr(&msg);
        true
    }

    /// Report an error immediately (ignores interval timing).
    pub fn report_error(&self, error: &SyncError) {
        if !self.enabled {
            return;
        }

        let msg = ErrorProgressMessage {
            msg_type: "err",
            seq: self.next_seq(),
            ts: self.current_timestamp(),
            error_type: format!("{:?}", error.kind),
            message: error.message.clone(),
            path: error.path.as_ref().map(|p| p.to_string_lossy().to_string()),
        };
        self.output_to_stderr(&msg);
    }

    /// Report pass completion
    pub fn report_done(&self, report: &SyncReport) {
        if !self.enabled {
            return;
        }

        let msg = DoneMessage {
            msg_type: "done",
            seq: self.next_seq(),
            ts: self.current_timestamp(),
            pointers_written: report.pointers.success,
            copies_written: report.copies.success,
            orphans_deleted: report.deleted,
            missing: report.missing,
            error_count: report.scan_errors
                + report.pointers.failed
                + report.copies.failed
                + report.delete_errors,
            cancelled: report.cancelled,
            ms: report.duration_ms,
        };
        self.output_to_stderr(&msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_phase_serialization() {
        assert_eq!(serde_json::to_string(&SyncPhase::Scan).unwrap(), "\"scan\"");
        assert_eq!(
            serde_json::to_string(&SyncPhase::Reconcile).unwrap(),
            "\"reconcile\""
        );
    }

    #[test]
    fn test_progress_message_serialization() {
        let msg = ProgressMessage {
            msg_type: "p",
            seq: 2,
            ts: 200,
            phase: SyncPhase::Scan,
            media: 10,
            metadata: 4,
            image: 3,
            unknown: 1,
            written: 7,
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();

        assert_eq!(parsed["_t"], "p");
        assert_eq!(parsed["phase"], "scan");
        assert_eq!(parsed["m"], 10);
        assert_eq!(parsed["n"], 4);
        assert_eq!(parsed["i"], 3);
        assert_eq!(parsed["u"], 1);
        assert_eq!(parsed["w"], 7);
    }

    #[test]
    fn test_start_message_without_since() {
        let msg = StartMessage {
            msg_type: "start",
            seq: 0,
            ts: 0,
            source: "/src".to_string(),
            output: "/out".to_string(),
            mount: "/emby".to_string(),
            incremental: false,
            since: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("since"));
        assert!(json.contains("\"mount\":\"/emby\""));
    }

    #[test]
    fn test_error_message_without_path() {
        let msg = ErrorProgressMessage {
            msg_type: "err",
            seq: 1,
            ts: 100,
            error_type: "FileCopy".to_string(),
            message: "boom".to_string(),
            path: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"path\""));
    }

    #[test]
    fn test_done_message_serialization() {
        let msg = DoneMessage {
            msg_type: "done",
            seq: 9,
            ts: 5000,
            pointers_written: 3,
            copies_written: 2,
            orphans_deleted: 1,
            missing: 5,
            error_count: 0,
            cancelled: false,
            ms: 4500,
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed["_t"], "done");
        assert_eq!(parsed["pw"], 3);
        assert_eq!(parsed["cw"], 2);
        assert_eq!(parsed["od"], 1);
        assert_eq!(parsed["mi"], 5);
        assert_eq!(parsed["cancelled"], false);
    }

    #[test]
    fn test_progress_reporter_sequence_numbers() {
        let reporter = ProgressReporter::new(true, 200);
        assert_eq!(reporter.next_seq(), 0);
        assert_eq!(reporter.next_seq(), 1);
        assert_eq!(reporter.next_seq(), 2);
    }

    #[test]
    fn test_progress_reporter_interval() {
        let reporter = ProgressReporter::new(true, 50);
        let counts = KindCounts::default();

        // The slot was just initialised at creation.
        assert!(!reporter.report_progress(SyncPhase::Scan, &counts, 0));
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(reporter.report_progress(SyncPhase::Scan, &counts, 0));
        assert!(!reporter.report_progress(SyncPhase::Scan, &counts, 0));
    }

    #[test]
    fn test_disabled_reporter_is_silent() {
        let reporter = ProgressReporter::new(false, 0);

        reporter.report_start(&SyncConfig::default(), None);
        reporter.report_error(&SyncError::database("x"));
        reporter.report_done(&SyncReport::new());
        assert!(!reporter.report_progress(SyncPhase::Scan, &KindCounts::default(), 0));

        // Nothing consumed a sequence number.
        assert_eq!(reporter.next_seq(), 0);
    }
}
