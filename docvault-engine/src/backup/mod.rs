//! Backup orchestrator: drives a [`DocumentSource`] into a [`SnapshotWriter`].
//!
//! Collections are independent units of work run on a bounded pool. A
//! collection that fails is recorded and gets no manifest entry; its
//! siblings carry on. A lost connection or a cancellation interrupts every
//! collection, keeps their staged chunks for `--resume`, and skips the
//! manifest.

use crate::events::{EventBus, VaultEvent};
use crate::policy::ExclusionPolicy;
use crate::progress::{format_bytes, format_duration, spawn_progress_logger, ProgressCounters};
use crate::snapshot::{OpenedCollection, SnapshotWriter, WriteHandle, WriterOptions};
use crate::source::{stream_documents, CollectionRef, DocumentSource};
use crate::utils::Result;
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub max_concurrent_collections: usize,
    pub fetch_batch_size: usize,
    pub exclusion: ExclusionPolicy,
    /// Continue an interrupted backup in the same directory.
    pub resume: bool,
    pub writer: WriterOptions,
    pub progress_interval: Duration,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            max_concurrent_collections: 4,
            fetch_batch_size: 1000,
            exclusion: ExclusionPolicy::default(),
            resume: false,
            writer: WriterOptions::default(),
            progress_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Committed,
    Failed,
    Skipped,
    /// Stopped by cancellation or a lost connection; staged chunks are kept.
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOutcome {
    pub collection: CollectionRef,
    pub status: CollectionStatus,
    pub doc_count: u64,
    pub bytes: u64,
    pub chunks: usize,
    pub elapsed_ms: u64,
    /// Committed by an earlier attempt and not read again.
    pub resumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionOutcome {
    fn new(collection: CollectionRef, status: CollectionStatus) -> Self {
        Self {
            collection,
            status,
            doc_count: 0,
            bytes: 0,
            chunks: 0,
            elapsed_ms: 0,
            resumed: false,
            error: None,
        }
    }

    fn failed(collection: CollectionRef, error: impl ToString, started: Instant) -> Self {
        Self {
            error: Some(error.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
            ..Self::new(collection, CollectionStatus::Failed)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Sorted by collection.
    pub collections: Vec<CollectionOutcome>,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub connection_lost: bool,
    pub manifest_written: bool,
}

impl BackupReport {
    pub fn count(&self, status: CollectionStatus) -> usize {
        self.collections.iter().filter(|c| c.status == status).count()
    }

    pub fn total_documents(&self) -> u64 {
        self.committed().map(|c| c.doc_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.committed().map(|c| c.bytes).sum()
    }

    fn committed(&self) -> impl Iterator<Item = &CollectionOutcome> {
        self.collections
            .iter()
            .filter(|c| c.status == CollectionStatus::Committed)
    }

    pub fn outcome(&self, collection: &CollectionRef) -> Option<&CollectionOutcome> {
        self.collections.iter().find(|c| &c.collection == collection)
    }

    /// Manifest written, no failed collection and no database left unlisted.
    pub fn is_success(&self) -> bool {
        self.manifest_written && self.count(CollectionStatus::Failed) == 0 && self.errors.is_empty()
    }

    /// 2 on a lost connection, 130 when cancelled, 1 if any collection failed.
    pub fn exit_code(&self) -> u8 {
        if self.connection_lost {
            2
        } else if self.cancelled {
            130
        } else if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} committed, {} failed, {} skipped, {} interrupted; {} documents, {} in {}",
            self.count(CollectionStatus::Committed),
            self.count(CollectionStatus::Failed),
            self.count(CollectionStatus::Skipped),
            self.count(CollectionStatus::Interrupted),
            self.total_documents(),
            format_bytes(self.total_bytes()),
            format_duration(self.elapsed_ms / 1000)
        )
    }
}

/// Shared state of one run, borrowed by every collection task.
struct RunContext<'a, S: ?Sized> {
    source: &'a S,
    writer: &'a SnapshotWriter,
    options: &'a BackupOptions,
    events: &'a EventBus,
    counters: &'a ProgressCounters,
    token: CancellationToken,
}

/// How a collection task ended, beyond its outcome.
enum Interruption {
    None,
    Cancelled,
    ConnectionLost(String),
}

pub struct BackupOrchestrator {
    options: BackupOptions,
    events: EventBus,
    cancel_token: CancellationToken,
}

impl BackupOrchestrator {
    /// Create a new orchestrator (no cancellation support)
    pub fn new(options: BackupOptions) -> Self {
        Self::with_cancel(options, CancellationToken::new())
    }

    /// Create a new orchestrator with cancellation support
    pub fn with_cancel(options: BackupOptions, cancel_token: CancellationToken) -> Self {
        Self {
            options,
            events: EventBus::new(),
            cancel_token,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Back up every non-excluded collection of `source` into `dir`.
    ///
    /// Fails before touching `dir` if the source is unreachable. Once the
    /// databases are listed a report is always returned.
    pub async fn run<S>(&self, source: &S, dir: &Path) -> Result<BackupReport>
    where
        S: DocumentSource + ?Sized,
    {
        let started = Instant::now();
        let started_at = Utc::now();

        let databases = source.list_databases().await?;
        if databases.is_empty() {
            info!("No databases to back up");
        } else {
            info!("Databases to back up: {}", databases.join(", "));
        }

        let writer = if self.options.resume {
            SnapshotWriter::resume(dir, self.options.writer.clone()).await?
        } else {
            SnapshotWriter::create(dir, self.options.writer.clone()).await?
        };
        self.events.emit(VaultEvent::BackupStarted {
            databases: databases.clone(),
            resumed: self.options.resume,
        });

        let mut outcomes = Vec::new();
        let mut errors = Vec::new();

        for (collection, _) in writer.committed() {
            if self.options.exclusion.is_excluded(&collection) {
                writer.discard_committed(&collection).await?;
            }
        }

        // Enumerate work. Excluded collections are reported without reading them.
        let mut work = Vec::new();
        for database in &databases {
            if self.options.exclusion.excludes_database(database) {
                info!(database = %database, "Skipping excluded database");
                continue;
            }
            let mut names = match source.list_collections(database).await {
                Ok(names) => names,
                Err(e) if e.is_connection() => return Err(e.into()),
                Err(e) => {
                    error!(database = %database, error = %e, "Cannot list collections");
                    errors.push(e.to_string());
                    continue;
                }
            };
            names.sort();
            names.dedup();
            info!(database = %database, collections = names.len(), "Backing up database");
            for name in names {
                let collection = CollectionRef::new(database.clone(), name);
                if self.options.exclusion.is_excluded(&collection) {
                    info!(collection = %collection, "Skipping excluded collection");
                    self.events.emit(VaultEvent::CollectionSkipped {
                        collection: collection.clone(),
                    });
                    outcomes.push(CollectionOutcome::new(collection, CollectionStatus::Skipped));
                } else {
                    work.push(collection);
                }
            }
        }

        let counters = ProgressCounters::new();
        counters.set_total(work.len());
        let progress_stop = CancellationToken::new();
        let progress_task = spawn_progress_logger(
            "Backup",
            Arc::clone(&counters),
            self.options.progress_interval,
            progress_stop.clone(),
        );

        let ctx = RunContext {
            source,
            writer: &writer,
            options: &self.options,
            events: &self.events,
            counters: &counters,
            token: self.cancel_token.child_token(),
        };
        let semaphore = Semaphore::new(self.options.max_concurrent_collections.max(1));
        let seen: HashSet<CollectionRef> = work.iter().cloned().collect();

        let mut tasks: FuturesUnordered<_> = work
            .into_iter()
            .map(|collection| ctx.run_collection(collection, &semaphore))
            .collect();

        let mut cancelled = false;
        let mut connection_error = None;
        while let Some((outcome, interruption)) = tasks.next().await {
            match interruption {
                Interruption::None => {}
                Interruption::Cancelled => cancelled = true,
                Interruption::ConnectionLost(msg) => {
                    if connection_error.is_none() {
                        error!(error = %msg, "Connection lost, interrupting backup");
                        ctx.token.cancel();
                        connection_error = Some(msg);
                    }
                }
            }
            if let Some(err) = &outcome.error {
                errors.push(format!("{}: {}", outcome.collection, err));
            }
            counters.collection_done();
            outcomes.push(outcome);
        }
        drop(tasks);
        drop(ctx);
        progress_stop.cancel();
        let _ = progress_task.await;

        // Collections committed by an earlier attempt that the source no longer lists.
        for (collection, entry) in writer.committed() {
            if !seen.contains(&collection) {
                outcomes.push(CollectionOutcome {
                    doc_count: entry.doc_count,
                    bytes: entry.total_bytes(),
                    chunks: entry.chunk_files.len(),
                    resumed: true,
                    ..CollectionOutcome::new(collection, CollectionStatus::Committed)
                });
            }
        }

        let connection_lost = connection_error.is_some();
        cancelled |= self.cancel_token.is_cancelled();
        if let Some(msg) = connection_error {
            errors.push(format!("connection lost: {msg}"));
        }

        let manifest_written = if cancelled || connection_lost {
            warn!(dir = %dir.display(), "Backup interrupted; no manifest written, rerun with --resume to continue");
            false
        } else {
            writer.finish().await?;
            true
        };

        outcomes.sort_by(|a, b| a.collection.cmp(&b.collection));
        let report = BackupReport {
            dir: dir.to_path_buf(),
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            collections: outcomes,
            errors,
            cancelled,
            connection_lost,
            manifest_written,
        };

        self.events.emit(VaultEvent::RunCompleted {
            succeeded: report.count(CollectionStatus::Committed),
            failed: report.count(CollectionStatus::Failed),
            skipped: report.count(CollectionStatus::Skipped),
            cancelled,
        });
        info!("Backup finished: {}", report.summary());
        Ok(report)
    }
}

impl<S: DocumentSource + ?Sized> RunContext<'_, S> {
    async fn run_collection(
        &self,
        collection: CollectionRef,
        semaphore: &Semaphore,
    ) -> (CollectionOutcome, Interruption) {
        let interrupted = |collection: CollectionRef| {
            (
                CollectionOutcome::new(collection, CollectionStatus::Interrupted),
                Interruption::Cancelled,
            )
        };

        // Check cancellation before acquiring permit
        if self.token.is_cancelled() {
            return interrupted(collection);
        }
        let _permit = tokio::select! {
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return interrupted(collection),
            },
            _ = self.token.cancelled() => return interrupted(collection),
        };
        if self.token.is_cancelled() {
            return interrupted(collection);
        }

        self.backup_collection(collection).await
    }

    async fn backup_collection(&self, collection: CollectionRef) -> (CollectionOutcome, Interruption) {
        let started = Instant::now();

        let (mut handle, resume) = match self.writer.open_collection(&collection).await {
            Ok(OpenedCollection::Committed(entry)) => {
                info!(collection = %collection, "Already committed, not read again");
                self.counters.add_documents(entry.doc_count);
                self.counters.add_bytes(entry.total_bytes());
                self.events.emit(VaultEvent::CollectionCommitted {
                    collection: collection.clone(),
                    doc_count: entry.doc_count,
                    resumed: true,
                });
                let outcome = CollectionOutcome {
                    doc_count: entry.doc_count,
                    bytes: entry.total_bytes(),
                    chunks: entry.chunk_files.len(),
                    resumed: true,
                    ..CollectionOutcome::new(collection, CollectionStatus::Committed)
                };
                return (outcome, Interruption::None);
            }
            Ok(OpenedCollection::Partial { handle, resume }) => (handle, Some(resume)),
            Ok(OpenedCollection::Fresh(handle)) => (handle, None),
            Err(e) => return self.fail(collection, e, started),
        };

        info!(collection = %collection, resumed = resume.is_some(), "Backing up collection");
        self.events.emit(VaultEvent::CollectionStarted {
            collection: collection.clone(),
        });

        let mut cursor = stream_documents(
            self.source,
            collection.clone(),
            resume,
            self.options.fetch_batch_size,
        );

        loop {
            if self.token.is_cancelled() {
                return suspend(handle, started);
            }
            let batch = match cursor.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) if e.is_connection() => {
                    let (outcome, _) = suspend(handle, started);
                    return (outcome, Interruption::ConnectionLost(e.to_string()));
                }
                Err(e) => {
                    discard(handle).await;
                    return self.fail(collection, e, started);
                }
            };

            handle.mark_position(batch.origin, batch.skipped);
            for doc in &batch.documents {
                // No new chunk writes once cancelled.
                if self.token.is_cancelled() {
                    return suspend(handle, started);
                }
                match handle.append(doc).await {
                    Ok(Some(chunk)) => {
                        self.counters.add_bytes(chunk.bytes);
                        self.events.emit(VaultEvent::ChunkFlushed {
                            collection: collection.clone(),
                            file: chunk.file,
                            doc_count: chunk.doc_count,
                            bytes: chunk.bytes,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        discard(handle).await;
                        return self.fail(collection, e, started);
                    }
                }
                self.counters.add_documents(1);
            }
        }

        let staged_bytes: u64 = handle.chunks().iter().map(|c| c.bytes).sum();
        match handle.commit().await {
            Ok(entry) => {
                self.counters.add_bytes(entry.total_bytes().saturating_sub(staged_bytes));
                self.events.emit(VaultEvent::CollectionCommitted {
                    collection: collection.clone(),
                    doc_count: entry.doc_count,
                    resumed: false,
                });
                let outcome = CollectionOutcome {
                    doc_count: entry.doc_count,
                    bytes: entry.total_bytes(),
                    chunks: entry.chunk_files.len(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    ..CollectionOutcome::new(collection, CollectionStatus::Committed)
                };
                (outcome, Interruption::None)
            }
            Err(e) => self.fail(collection, e, started),
        }
    }

    fn fail(
        &self,
        collection: CollectionRef,
        error: impl std::fmt::Display,
        started: Instant,
    ) -> (CollectionOutcome, Interruption) {
        warn!(collection = %collection, error = %error, "Collection backup failed");
        self.events.emit(VaultEvent::CollectionFailed {
            collection: collection.clone(),
            error: error.to_string(),
        });
        (CollectionOutcome::failed(collection, error, started), Interruption::None)
    }
}

fn suspend(handle: WriteHandle, started: Instant) -> (CollectionOutcome, Interruption) {
    let mut outcome = CollectionOutcome::new(handle.collection().clone(), CollectionStatus::Interrupted);
    outcome.chunks = handle.chunks().len();
    outcome.doc_count = handle.chunks().iter().map(|c| c.doc_count).sum();
    outcome.elapsed_ms = started.elapsed().as_millis() as u64;
    handle.suspend();
    (outcome, Interruption::Cancelled)
}

async fn discard(handle: WriteHandle) {
    let collection = handle.collection().clone();
    if let Err(e) = handle.abort().await {
        warn!(collection = %collection, error = %e, "Cannot discard staged chunks");
    }
}
