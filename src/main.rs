//! STRM Mirror CLI
//!
//! Keeps a local pointer-file mirror of a remote-mounted media library.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use strm_mirror::{
    audit_mirror, run_sync, scan_and_collect, CancelToken, MirrorAudit, PathMapper, StrmMapper,
    SyncConfig, SyncError, SyncReport,
};

const ABOUT: &str = r#"
STRM Mirror - pointer-file mirror for remote media libraries

Examples:
  strm_mirror sync -s /mnt/s3/media -o /srv/strm -m /emby          full pass
  strm_mirror sync -s /mnt/s3 -o /srv/strm -m /emby -i -d state.db  incremental pass
  strm_mirror sync ... --no-delete                                  keep orphans
  strm_mirror scan -s /mnt/s3/media --json                          count files only
  strm_mirror orphans -s /mnt/s3 -o /srv/strm -m /emby              list orphans
  strm_mirror orphans ... --delete                                  delete orphans
"#;

#[derive(Parser)]
#[command(name = "strm_mirror")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Roots shared by the commands that touch the mirror
#[derive(Args)]
struct MirrorArgs {
    /// Root of the media library
    #[arg(short = 's', long)]
    source: PathBuf,

    /// Root of the pointer mirror
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Prefix written at the start of every pointer (e.g. /emby)
    #[arg(short = 'm', long)]
    mount: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one mirror pass: scan, write pointers and copies, remove orphans
    Sync {
        #[command(flatten)]
        mirror: MirrorArgs,

        /// Only visit entries changed since the last complete run (needs --db)
        #[arg(short = 'i', long)]
        incremental: bool,

        /// Explicit incremental threshold (RFC 3339), overrides the stored one
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Keep mirror files whose source is gone
        #[arg(long)]
        no_delete: bool,

        /// Consumer threads, 0 = auto
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,

        /// SQLite state database
        #[arg(short = 'd', long)]
        db: Option<PathBuf>,

        /// Emit JSON progress lines on stderr
        #[arg(long)]
        progress: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Scan the library and print the per-kind tally
    Scan {
        /// Root of the media library
        #[arg(short = 's', long)]
        source: PathBuf,

        /// Print the tally as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare the mirror against the library without writing
    Orphans {
        #[command(flatten)]
        mirror: MirrorArgs,

        /// Delete the orphans that were found
        #[arg(long)]
        delete: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cancel = CancelToken::new();
    if let Err(e) = install_signal_handler(&cancel) {
        warn!("Failed to install signal handler: {}", e);
    }

    let outcome = match cli.command {
        Some(Commands::Sync {
            mirror,
            incremental,
            since,
            no_delete,
            threads,
            db,
            progress,
            json,
        }) => {
            let mut builder = SyncConfig::builder()
                .source_root(mirror.source)
                .output_root(mirror.output)
                .mount_prefix(mirror.mount)
                .incremental(incremental)
                .delete_orphans(!no_delete)
                .num_threads(threads)
                .show_progress(progress);
            if let Some(since) = since {
                builder = builder.since(since);
            }
            if let Some(db) = db {
                builder = builder.db_path(db);
            }
            let config = builder.build();
            let mapper = mapper_for(&config);
            run_sync(&config, mapper, &cancel).and_then(|report| print_report(&report, json))
        }
        Some(Commands::Scan { source, json }) => {
            info!("Scanning {}", source.display());
            let (result, _) = scan_and_collect(&source, None, &cancel);
            for err in &result.errors {
                error!("{}", err);
            }
            if json {
                print_json(&result.counts)
            } else {
                println!("Scan completed:");
                println!("  Media:    {}", result.counts.media);
                println!("  Metadata: {}", result.counts.metadata);
                println!("  Image:    {}", result.counts.image);
                println!("  Unknown:  {}", result.counts.unknown);
                println!("  Errors:   {}", result.error_count());
                Ok(())
            }
        }
        Some(Commands::Orphans {
            mirror,
            delete,
            json,
        }) => {
            let config = SyncConfig::new(mirror.source, mirror.output, mirror.mount);
            let mapper = mapper_for(&config);
            audit_mirror(&config, mapper.as_ref(), delete, &cancel)
                .and_then(|audit| print_audit(&audit, json))
        }
        None => {
            println!("{}", ABOUT);
            println!("Use 'strm_mirror <command> -h' for the options of a command");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Turn SIGINT/SIGTERM (Ctrl+C on Windows) into a cancellation so in-flight
/// writes finish or are removed instead of being cut off.
#[cfg(unix)]
fn install_signal_handler(cancel: &CancelToken) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let cancel = cancel.clone();
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("Received signal {}, cancelling...", sig);
            cancel.cancel();
        }
    });
    Ok(())
}

#[cfg(windows)]
fn install_signal_handler(cancel: &CancelToken) -> std::io::Result<()> {
    let cancel = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, cancelling...");
        cancel.cancel();
    })
    .map_err(std::io::Error::other)
}

#[cfg(not(any(unix, windows)))]
fn install_signal_handler(_cancel: &CancelToken) -> std::io::Result<()> {
    Ok(())
}

fn mapper_for(config: &SyncConfig) -> Arc<dyn PathMapper> {
    Arc::new(StrmMapper::new(
        config.source_root.clone(),
        config.output_root.clone(),
        config.mount_prefix.clone(),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), SyncError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SyncError::invalid_config(format!("failed to serialize output: {e}")))?;
    println!("{}", json);
    Ok(())
}

fn print_report(report: &SyncReport, json: bool) -> Result<(), SyncError> {
    if json {
        return print_json(report);
    }

    println!(
        "{} completed{}:",
        if report.incremental { "Incremental pass" } else { "Full pass" },
        if report.cancelled { " (cancelled)" } else { "" }
    );
    println!(
        "  Files:    {} media, {} metadata, {} image, {} unknown",
        report.counts.media, report.counts.metadata, report.counts.image, report.counts.unknown
    );
    println!(
        "  Pointers: {} written, {} skipped, {} failed",
        report.pointers.success, report.pointers.skipped, report.pointers.failed
    );
    println!(
        "  Copies:   {} written, {} skipped, {} failed",
        report.copies.success, report.copies.skipped, report.copies.failed
    );
    println!(
        "  Orphans:  {} found, {} deleted, {} errors",
        report.orphans, report.deleted, report.delete_errors
    );
    println!("  Missing:  {}", report.missing);
    println!("  Scan errors: {}", report.scan_errors);
    println!("  Duration: {}ms", report.duration_ms);
    Ok(())
}

fn print_audit(audit: &MirrorAudit, json: bool) -> Result<(), SyncError> {
    if json {
        return print_json(audit);
    }

    for path in &audit.orphans {
        println!("orphan  {}", path.display());
    }
    for path in &audit.missing {
        println!("missing {}", path.display());
    }
    println!(
        "{} orphans, {} missing, {} deleted, {} scan errors",
        audit.orphans.len(),
        audit.missing.len(),
        audit.deleted,
        audit.scan_errors
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_sigterm_cancels_the_pass() {
        let cancel = CancelToken::new();
        install_signal_handler(&cancel).unwrap();

        signal_hook::low_level::raise(signal_hook::consts::SIGTERM).unwrap();
        for _ in 0..200 {
            if cancel.is_cancelled() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_parse_since() {
        let since = parse_since("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(since.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(parse_since("yesterday").is_err());
    }
}
