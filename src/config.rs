//! Configuration for a mirror pass

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::SyncError;

/// Default capacity of the record queue between scanner and consumers
pub const DEFAULT_RECORD_BUFFER: usize = 100;

/// Default capacity of the scan error side-channel
pub const DEFAULT_ERROR_BUFFER: usize = 10;

/// Default interval between progress messages
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;

/// Configuration for one mirror pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root of the media library (usually a remote mount)
    pub source_root: PathBuf,

    /// Root of the mirror that receives pointer and auxiliary files
    pub output_root: PathBuf,

    /// Prefix every pointer content must start with (e.g. "/emby")
    pub mount_prefix: String,

    /// Only visit entries modified since the last recorded scan
    pub incremental: bool,

    /// Explicit incremental threshold; overrides the stored checkpoint
    pub since: Option<DateTime<Utc>>,

    /// Remove mirror files whose source is gone (full passes only)
    pub delete_orphans: bool,

    /// Number of consumer threads
    /// 0 means auto-detect (CPU cores × 2)
    pub num_threads: usize,

    /// State database path; no state is kept across runs when unset
    pub db_path: Option<PathBuf>,

    /// Emit JSON progress lines on stderr
    pub show_progress: bool,

    /// Capacity of the record queue
    pub record_buffer: usize,

    /// Capacity of the scan error side-channel
    pub error_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::new(),
            output_root: PathBuf::new(),
            mount_prefix: String::new(),
            incremental: false,
            since: None,
            delete_orphans: true,
            num_threads: 0,
            db_path: None,
            show_progress: false,
            record_buffer: DEFAULT_RECORD_BUFFER,
            error_buffer: DEFAULT_ERROR_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Create a config for the given roots and mount prefix
    pub fn new(source_root: PathBuf, output_root: PathBuf, mount_prefix: impl Into<String>) -> Self {
        Self {
            source_root,
            output_root,
            mount_prefix: normalize_mount_prefix(&mount_prefix.into()),
            ..Default::default()
        }
    }

    /// Create a config builder
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Reject configurations that would produce unusable pointers or
    /// write the mirror over the source.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.mount_prefix.is_empty() {
            return Err(SyncError::invalid_config("mount prefix must not be empty"));
        }
        if !self.mount_prefix.starts_with('/') {
            return Err(SyncError::invalid_config(format!(
                "mount prefix must be absolute: {}",
                self.mount_prefix
            )));
        }
        if self.source_root.as_os_str().is_empty() || self.output_root.as_os_str().is_empty() {
            return Err(SyncError::invalid_config(
                "source and output roots must be set",
            ));
        }
        if self.source_root == self.output_root {
            return Err(SyncError::invalid_config(
                "source and output roots must differ",
            ));
        }
        // A nested mirror would be scanned as source on every pass.
        if self.output_root.starts_with(&self.source_root)
            || self.source_root.starts_with(&self.output_root)
        {
            return Err(SyncError::invalid_config(format!(
                "source and output roots must not contain each other: {} / {}",
                self.source_root.display(),
                self.output_root.display()
            )));
        }
        if self.record_buffer == 0 || self.error_buffer == 0 {
            return Err(SyncError::invalid_config("channel capacities must be non-zero"));
        }
        Ok(())
    }

    /// Get the effective number of threads
    pub fn effective_threads(&self) -> usize {
        if self.num_threads == 0 {
            // Auto-detect: CPU cores × 2
            std::thread::available_parallelism()
                .map(|p| p.get() * 2)
                .unwrap_or(4)
        } else {
            self.num_threads
        }
    }
}

/// Strip trailing separators so "/emby/" and "/emby" validate the same.
pub fn normalize_mount_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim();
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() && trimmed.starts_with('/') {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

/// Builder for SyncConfig
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_root(mut self, root: PathBuf) -> Self {
        self.config.source_root = root;
        self
    }

    pub fn output_root(mut self, root: PathBuf) -> Self {
        self.config.output_root = root;
        self
    }

    /// Set the mount prefix (normalized)
    pub fn mount_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.mount_prefix = normalize_mount_prefix(&prefix.into());
        self
    }

    pub fn incremental(mut self, enabled: bool) -> Self {
        self.config.incremental = enabled;
        self
    }

    /// Scan only entries modified after `since`; implies incremental
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.config.since = Some(since);
        self.config.incremental = true;
        self
    }

    pub fn delete_orphans(mut self, enabled: bool) -> Self {
        self.config.delete_orphans = enabled;
        self
    }

    /// Set the number of threads
    pub fn num_threads(mut self, threads: usize) -> Self {
        self.config.num_threads = threads;
        self
    }

    /// Set the database path
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.config.db_path = Some(path);
        self
    }

    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.config.show_progress = enabled;
        self
    }

    pub fn record_buffer(mut self, capacity: usize) -> Self {
        self.config.record_buffer = capacity;
        self
    }

    pub fn error_buffer(mut self, capacity: usize) -> Self {
        self.config.error_buffer = capacity;
        self
    }

    /// Build the config
    pub fn build(self) -> SyncConfig {
        self.config
    }
}
