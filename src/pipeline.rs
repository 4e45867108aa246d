//! One mirror pass: scan, fan out to the writers, reconcile, checkpoint.

use chrono::{DateTime, Utc};
use rayon::iter::{ParallelBridge, ParallelIterator};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::config::{SyncConfig, DEFAULT_PROGRESS_INTERVAL_MS};
use crate::db::{index_key, MirrorState};
use crate::error::SyncError;
use crate::generator::PointerGenerator;
use crate::mapper::PathMapper;
use crate::models::{FileKind, FileRecord, KindCounts, OpCounts, PathSet, SyncReport};
use crate::progress::{ProgressReporter, SyncPhase};
use crate::scanner::{self, ScanOptions};
use crate::syncer::{delete_orphans, find_missing, find_orphans, list_mirror, CopySyncer};

/// Accumulator shared by the record consumers
#[derive(Default)]
struct Tally {
    counts: KindCounts,
    pointers: OpCounts,
    copies: OpCounts,
    /// Mirror paths the scanned sources imply
    current: PathSet,
    /// Relevant records, kept for the state index
    records: Vec<FileRecord>,
    error_messages: Vec<String>,
}

impl Tally {
    fn written(&self) -> u64 {
        self.pointers.success + self.copies.success
    }
}

/// Everything a consumer needs to handle one record
struct Workers<'a> {
    mapper: &'a dyn PathMapper,
    generator: PointerGenerator,
    syncer: CopySyncer,
    reporter: &'a ProgressReporter,
    cancel: &'a CancelToken,
    keep_records: bool,
}

impl Workers<'_> {
    fn process(&self, record: FileRecord, tally: &Mutex<Tally>) {
        let (dest, status, error) = match record.kind {
            FileKind::Media => {
                let dest = self.generator.destination(&record.path);
                let result = self.generator.generate(&record.path, self.cancel);
                (Some(dest), Some(result.status), result.error)
            }
            FileKind::Metadata | FileKind::Image => {
                let dest = self.mapper.to_copy_path(&record.path);
                let result = self.syncer.copy(&record.path, &dest, self.cancel);
                (Some(dest), Some(result.status), result.error)
            }
            FileKind::Unknown => (None, None, None),
        };

        if let Some(err) = &error {
            if !err.is_cancelled() {
                log::warn!("{}", err);
                self.reporter.report_error(err);
            }
        }

        let (counts, written) = {
            let mut tally = tally.lock().unwrap_or_else(|e| e.into_inner());
            tally.counts.add(record.kind);
            match (record.kind, status) {
                (FileKind::Media, Some(status)) => tally.pointers.add(status),
                (_, Some(status)) => tally.copies.add(status),
                _ => {}
            }
            if let Some(dest) = dest {
                tally.current.insert(dest);
            }
            if let Some(err) = error {
                tally.error_messages.push(err.to_string());
            }
            if self.keep_records && record.kind.is_relevant() {
                tally.records.push(record);
            }
            (tally.counts, tally.written())
        };

        self.reporter.report_progress(SyncPhase::Scan, &counts, written);
    }
}

/// Run one pass over `config.source_root`.
///
/// Per-item failures are counted in the report; only configuration, state
/// store and thread-pool failures are returned as errors.
pub fn run_sync(
    config: &SyncConfig,
    mapper: Arc<dyn PathMapper>,
    cancel: &CancelToken,
) -> Result<SyncReport, SyncError> {
    config.validate()?;

    let started = Instant::now();
    let started_at = Utc::now();

    let mut state = match &config.db_path {
        Some(path) => Some(MirrorState::open(path)?),
        None => None,
    };
    let since = resolve_since(config, state.as_ref())?;

    let reporter = Arc::new(ProgressReporter::new(
        config.show_progress,
        DEFAULT_PROGRESS_INTERVAL_MS,
    ));
    reporter.report_start(config, since);
    log::info!(
        "Starting {} pass: {} -> {}",
        if since.is_some() { "incremental" } else { "full" },
        config.source_root.display(),
        config.output_root.display()
    );

    let options = ScanOptions {
        since,
        record_buffer: config.record_buffer,
        error_buffer: config.error_buffer,
    };
    let handle = scanner::scan_with_options(&config.source_root, options, cancel);

    // Drain the error side-channel alongside the records so the producer
    // can never park on either one.
    let error_drain = {
        let errors = handle.errors.clone();
        let reporter = Arc::clone(&reporter);
        std::thread::spawn(move || {
            errors
                .iter()
                .inspect(|err| reporter.report_error(err))
                .collect::<Vec<_>>()
        })
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.effective_threads())
        .thread_name(|i| format!("mirror-worker-{i}"))
        .build()
        .map_err(|e| SyncError::invalid_config(format!("failed to build thread pool: {e}")))?;

    let workers = Workers {
        mapper: mapper.as_ref(),
        generator: PointerGenerator::new(Arc::clone(&mapper), config.mount_prefix.clone()),
        syncer: CopySyncer::new(),
        reporter: &reporter,
        cancel,
        keep_records: state.is_some(),
    };
    let tally = Mutex::new(Tally::default());
    let records = handle.records.clone();
    pool.install(|| {
        records
            .into_iter()
            .par_bridge()
            .for_each(|record| workers.process(record, &tally));
    });

    let summary = handle.join();
    let scan_errors = error_drain.join().unwrap_or_else(|_| {
        log::error!("Error drain thread panicked");
        Vec::new()
    });
    let tally = tally.into_inner().unwrap_or_else(|e| e.into_inner());

    let mut report = SyncReport::new();
    report.counts = tally.counts;
    report.pointers = tally.pointers;
    report.copies = tally.copies;
    report.incremental = since.is_some();
    report.cancelled = cancel.is_cancelled() || summary.cancelled;
    report.scan_errors = scan_errors.len() as u64 + summary.errors_dropped;
    report.error_messages = scan_errors.iter().map(|e| e.to_string()).collect();
    report.error_messages.extend(tally.error_messages);

    reconcile(config, &tally.current, cancel, &mut report, &reporter);

    report.cancelled = report.cancelled || cancel.is_cancelled();
    report.duration_ms = started.elapsed().as_millis() as u64;

    if let Some(state) = state.as_mut() {
        if let Err(e) = checkpoint(state, &tally.records, started_at, &report) {
            log::error!("Failed to update mirror state: {}", e);
        }
    }

    reporter.report_done(&report);
    log::info!(
        "Pass finished in {}ms: {} media, {} metadata, {} image, {} unknown; \
         pointers {}/{}/{} (new/skipped/failed), copies {}/{}/{}, orphans deleted {}",
        report.duration_ms,
        report.counts.media,
        report.counts.metadata,
        report.counts.image,
        report.counts.unknown,
        report.pointers.success,
        report.pointers.skipped,
        report.pointers.failed,
        report.copies.success,
        report.copies.skipped,
        report.copies.failed,
        report.deleted,
    );
    Ok(report)
}

/// An explicit threshold wins; otherwise incremental passes resume from the
/// last complete run. Without either the pass is a full scan.
fn resolve_since(
    config: &SyncConfig,
    state: Option<&MirrorState>,
) -> Result<Option<DateTime<Utc>>, SyncError> {
    if let Some(since) = config.since {
        return Ok(Some(since));
    }
    if !config.incremental {
        return Ok(None);
    }
    match state {
        Some(state) => {
            let since = state.last_scan_time()?;
            if since.is_none() {
                log::info!("No previous complete run recorded, falling back to a full scan");
            }
            Ok(since)
        }
        None => {
            log::warn!("Incremental pass requested without a state database, running a full scan");
            Ok(None)
        }
    }
}

/// Diff the mirror against what the scan implies and remove orphans.
///
/// Orphans are only deleted after a complete full scan: an incremental,
/// cancelled or partially failed scan leaves `current` short and would
/// make live mirror files look orphaned.
fn reconcile(
    config: &SyncConfig,
    current: &PathSet,
    cancel: &CancelToken,
    report: &mut SyncReport,
    reporter: &ProgressReporter,
) {
    if report.cancelled {
        log::info!("Pass cancelled, skipping reconciliation");
        return;
    }
    let written = report.pointers.success + report.copies.success;
    reporter.report_progress(SyncPhase::Reconcile, &report.counts, written);

    let existing = list_mirror(&config.output_root);
    let missing = find_missing(&existing, current);
    report.missing = missing.len() as u64;
    for path in &missing {
        log::debug!("Missing from mirror: {}", path.display());
    }

    if report.incremental {
        return;
    }

    let orphans = find_orphans(&existing, current);
    report.orphans = orphans.len() as u64;
    if orphans.is_empty() {
        return;
    }

    if !config.delete_orphans {
        log::info!("{} orphans found, deletion disabled", orphans.len());
        return;
    }
    if report.scan_errors > 0 {
        log::warn!(
            "{} orphans found but the scan was incomplete ({} errors), not deleting",
            orphans.len(),
            report.scan_errors
        );
        return;
    }

    let (deleted, errors) = delete_orphans(&orphans, cancel);
    report.deleted = deleted as u64;
    report.delete_errors = errors as u64;
    log::info!("Deleted {} orphans ({} errors)", deleted, errors);
}

/// Persist the scanned index and the run.
fn checkpoint(
    state: &mut MirrorState,
    records: &[FileRecord],
    started_at: DateTime<Utc>,
    report: &SyncReport,
) -> Result<(), SyncError> {
    state.upsert_records(records)?;

    // A complete full scan is authoritative for what no longer exists.
    if !report.incremental && !report.cancelled && report.scan_errors == 0 {
        let seen: HashSet<String> = records.iter().map(|r| index_key(&r.path)).collect();
        let gone: Vec<String> = state
            .load_file_index()?
            .into_keys()
            .filter(|path| !seen.contains(path))
            .collect();
        if !gone.is_empty() {
            log::debug!("Dropping {} vanished sources from the index", gone.len());
        }
        state.delete_paths(&gone)?;
    }

    state.record_run(started_at, Utc::now(), report)?;
    Ok(())
}

/// Read-only comparison of the mirror against the source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorAudit {
    pub counts: KindCounts,
    pub orphans: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub scan_errors: u64,
    pub cancelled: bool,
    /// Orphans removed when deletion was requested
    pub deleted: u64,
    pub delete_errors: u64,
}

/// Scan the source and diff it against the mirror without writing anything.
///
/// With `delete` set, orphans are removed afterwards, but only if the scan
/// finished without errors.
pub fn audit_mirror(
    config: &SyncConfig,
    mapper: &dyn PathMapper,
    delete: bool,
    cancel: &CancelToken,
) -> Result<MirrorAudit, SyncError> {
    config.validate()?;

    let (scan, records) = scanner::scan_and_collect(&config.source_root, None, cancel);
    let current: PathSet = records
        .iter()
        .filter_map(|record| match record.kind {
            FileKind::Media => Some(mapper.to_mirror_path(&record.path)),
            FileKind::Metadata | FileKind::Image => Some(mapper.to_copy_path(&record.path)),
            FileKind::Unknown => None,
        })
        .collect();
    for err in &scan.errors {
        log::warn!("{}", err);
    }

    let existing = list_mirror(&config.output_root);
    let mut audit = MirrorAudit {
        counts: scan.counts,
        orphans: find_orphans(&existing, &current),
        missing: find_missing(&existing, &current),
        scan_errors: scan.error_count() as u64,
        cancelled: cancel.is_cancelled(),
        ..Default::default()
    };

    if delete && !audit.orphans.is_empty() {
        if audit.cancelled || audit.scan_errors > 0 {
            log::warn!("Scan incomplete, not deleting {} orphans", audit.orphans.len());
        } else {
            let (deleted, errors) = delete_orphans(&audit.orphans, cancel);
            audit.deleted = deleted as u64;
            audit.delete_errors = errors as u64;
        }
    }
    Ok(audit)
}
