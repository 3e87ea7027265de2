//! Docvault - Main entry point
//!
//! Backs up, restores and verifies document store snapshots.

mod shutdown;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docvault_engine::{
    config::Config, connect, utils, verify_snapshot, BackupOrchestrator, ErrorMode, EventBus,
    RestoreEngine, VaultError, VaultEvent,
};
use shutdown::ShutdownCoordinator;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Collections processed at the same time (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Namespace pattern to exclude, e.g. `local.*` (repeatable; replaces the configured list)
    #[arg(long = "exclude", value_name = "PATTERN", global = true)]
    exclude: Vec<String>,

    /// Write the run report as JSON to this file
    #[arg(long, value_name = "FILE", global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump every collection of a store into a snapshot directory
    Backup {
        /// Source store URI (file://<dir> or mem://)
        source: String,

        /// Snapshot directory
        dir: PathBuf,

        /// Continue an interrupted backup from its last durable chunk
        #[arg(long)]
        resume: bool,
    },

    /// Load a snapshot into a target store
    Restore {
        /// Target store URI (file://<dir> or mem://)
        target: String,

        /// Snapshot directory
        dir: PathBuf,

        /// What a rejected document does to its collection (continue, stop)
        #[arg(long, value_parser = parse_error_mode)]
        error_mode: Option<ErrorMode>,

        /// Largest tolerated fraction of rejected documents in continue mode
        #[arg(long)]
        max_failure_ratio: Option<f64>,
    },

    /// Read every chunk of a snapshot and check its checksums
    Verify {
        /// Snapshot directory
        dir: PathBuf,
    },
}

fn parse_error_mode(raw: &str) -> std::result::Result<ErrorMode, String> {
    match raw.to_ascii_lowercase().as_str() {
        "continue" => Ok(ErrorMode::Continue),
        "stop" => Ok(ErrorMode::Stop),
        other => Err(format!("unknown error mode {other:?} (expected continue or stop)")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<VaultError>()
        .map(VaultError::exit_code)
        .unwrap_or(1)
}

/// Load configuration and fold command-line overrides into it.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).map_err(VaultError::from)?,
        None => Config::default(),
    };

    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.performance.max_concurrent_collections = concurrency;
    }
    if !args.exclude.is_empty() {
        config.backup.exclude_namespaces = args.exclude.clone();
        config.restore.exclude_namespaces = args.exclude.clone();
    }
    if let Command::Restore {
        error_mode,
        max_failure_ratio,
        ..
    } = &args.command
    {
        if let Some(mode) = error_mode {
            config.restore.error_mode = *mode;
        }
        if let Some(ratio) = max_failure_ratio {
            config.restore.max_failure_ratio = *ratio;
        }
    }

    config.validate().map_err(VaultError::from)?;
    Ok(config)
}

async fn run(args: Args) -> Result<u8> {
    let config = load_config(&args)?;

    // Initialize logging
    utils::logger::init(&config.log.level)?;

    info!("Docvault v{}", env!("CARGO_PKG_VERSION"));

    let (cancel_token, signal_listener) = ShutdownCoordinator::new().spawn();

    let result = match &args.command {
        Command::Backup {
            source,
            dir,
            resume,
        } => {
            let mut options = config.backup_options().map_err(VaultError::from)?;
            options.resume = *resume;

            let store = connect(source, false).await.map_err(VaultError::from)?;
            let events = EventBus::new();
            let event_logger = spawn_event_logger(events.subscribe());
            let orchestrator =
                BackupOrchestrator::with_cancel(options, cancel_token.clone()).with_events(events);
            let report = orchestrator.run(&store, dir).await;
            drop(orchestrator);
            let _ = event_logger.await;
            let report = report?;

            for outcome in report.collections.iter().filter(|o| o.error.is_some()) {
                warn!(
                    "{} {:?}: {}",
                    outcome.collection,
                    outcome.status,
                    outcome.error.as_deref().unwrap_or_default()
                );
            }
            info!("{}", report.summary());
            write_report(args.report.as_deref(), &report)?;

            report.exit_code()
        }

        Command::Restore { target, dir, .. } => {
            let options = config.restore_options().map_err(VaultError::from)?;

            let store = connect(target, true).await.map_err(VaultError::from)?;
            let events = EventBus::new();
            let event_logger = spawn_event_logger(events.subscribe());
            let engine =
                RestoreEngine::with_cancel(options, cancel_token.clone()).with_events(events);
            let report = engine.run(&store, dir).await;
            drop(engine);
            let _ = event_logger.await;
            let report = report?;

            for outcome in report.collections.iter().filter(|o| o.error.is_some()) {
                warn!(
                    "{} {:?}: {}",
                    outcome.collection,
                    outcome.state,
                    outcome.error.as_deref().unwrap_or_default()
                );
            }
            info!("{}", report.summary());
            write_report(args.report.as_deref(), &report)?;

            report.exit_code()
        }

        Command::Verify { dir } => {
            let report = verify_snapshot(dir).await.map_err(VaultError::from)?;

            for collection in report.failed() {
                warn!(
                    "{}: {}",
                    collection.collection,
                    collection.error.as_deref().unwrap_or_default()
                );
            }
            info!(
                "Verified {} collections, {} failed",
                report.collections.len(),
                report.failed().count()
            );
            write_report(args.report.as_deref(), &report)?;

            if report.is_ok() {
                0
            } else {
                1
            }
        }
    };

    signal_listener.abort();
    Ok(result)
}

/// Log every run event at debug level until the bus closes.
fn spawn_event_logger(mut rx: broadcast::Receiver<VaultEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(target: "docvault::events", "{}", json),
                    Err(e) => warn!("Cannot encode event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(target: "docvault::events", "{} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Write `report` as pretty JSON when a report path was given.
fn write_report<T: serde::Serialize>(path: Option<&Path>, report: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let bytes = serde_json::to_vec_pretty(report).context("Failed to encode report")?;
    std::fs::write(path, bytes)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use tempfile::TempDir;

    #[test]
    fn test_backup_args() {
        let args = Args::try_parse_from([
            "docvault",
            "backup",
            "file:///data/db",
            "/backups/today",
            "--resume",
            "--exclude",
            "logs.*",
            "--exclude",
            "local",
            "--concurrency",
            "2",
        ])
        .unwrap();

        match &args.command {
            Command::Backup {
                source,
                dir,
                resume,
            } => {
                assert_eq!(source, "file:///data/db");
                assert_eq!(dir, &PathBuf::from("/backups/today"));
                assert!(*resume);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let config = load_config(&args).unwrap();
        assert_eq!(config.performance.max_concurrent_collections, 2);
        assert_eq!(config.backup.exclude_namespaces, vec!["logs.*", "local"]);
        assert_eq!(config.restore.exclude_namespaces, vec!["logs.*", "local"]);
    }

    #[test]
    fn test_restore_overrides() {
        let args = Args::try_parse_from([
            "docvault",
            "restore",
            "mem://",
            "/backups/today",
            "--error-mode",
            "stop",
            "--max-failure-ratio",
            "0.25",
        ])
        .unwrap();

        let config = load_config(&args).unwrap();
        assert_eq!(config.restore.error_mode, ErrorMode::Stop);
        assert_eq!(config.restore.max_failure_ratio, 0.25);
        assert_eq!(
            config.backup.exclude_namespaces,
            vec!["admin.system.version", "local.*"]
        );
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        assert!(Args::try_parse_from(["docvault", "restore", "mem://", "d", "--error-mode", "skip"])
            .is_err());

        let args = Args::try_parse_from(["docvault", "verify", "d", "--concurrency", "0"]).unwrap();
        let err = load_config(&args).unwrap_err();
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn test_config_file_and_override() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("docvault.toml");
        std::fs::write(&path, "[log]\nlevel = \"debug\"\n[performance]\nmax_concurrent_collections = 8\n")
            .unwrap();

        let args = Args::try_parse_from([
            "docvault",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "warn",
            "verify",
            "/backups/today",
        ])
        .unwrap();

        let config = load_config(&args).unwrap();
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.performance.max_concurrent_collections, 8);
    }

    #[test]
    fn test_connection_error_exit_code() {
        let err = anyhow::Error::from(VaultError::Connection("refused".into()));
        assert_eq!(exit_code_for(&err), 2);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }

    #[tokio::test]
    async fn test_event_logger_drains_until_bus_closes() {
        let events = EventBus::new();
        let logger = spawn_event_logger(events.subscribe());
        events.emit(VaultEvent::RestoreStarted { collections: 2 });
        drop(events);

        tokio::time::timeout(std::time::Duration::from_secs(5), logger)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_write_report() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.json");
        write_report(Some(&path), &serde_json::json!({ "ok": true })).unwrap();

        let written: JsonValue =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["ok"], true);

        write_report(None, &serde_json::json!({})).unwrap();
    }
}
