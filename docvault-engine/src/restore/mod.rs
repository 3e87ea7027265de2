//! Restore engine: replays a snapshot into a [`DocumentSink`].
//!
//! Each collection moves through `Pending -> InProgress -> {Committed, Failed}`;
//! excluded collections go straight from `Pending` to `Skipped` without any
//! write. Documents are inserted in chunk order. The engine never
//! deduplicates: re-running a restore relies on the target rejecting
//! duplicate `_id`s, which then show up as insert errors.

use crate::document::codec::render_value;
use crate::events::{EventBus, VaultEvent};
use crate::policy::ExclusionPolicy;
use crate::progress::{format_duration, spawn_progress_logger, ProgressCounters};
use crate::snapshot::{CollectionEntry, SnapshotManifest, SnapshotReader};
use crate::source::{CollectionRef, DocumentSink};
use crate::utils::{InsertError, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Insert errors kept per collection in the report.
const MAX_REPORTED_INSERT_ERRORS: usize = 100;

/// What a rejected document does to its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Attempt every document; fail the collection if too many were rejected.
    #[default]
    Continue,
    /// The first rejected document fails the collection.
    Stop,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub error_mode: ErrorMode,
    /// Largest tolerated fraction of rejected documents in continue mode.
    pub max_failure_ratio: f64,
    pub insert_batch_size: usize,
    pub max_concurrent_collections: usize,
    pub exclusion: ExclusionPolicy,
    pub progress_interval: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            error_mode: ErrorMode::Continue,
            max_failure_ratio: 0.0,
            insert_batch_size: 1000,
            max_concurrent_collections: 4,
            exclusion: ExclusionPolicy::default(),
            progress_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionState {
    Pending,
    InProgress,
    Committed,
    Failed,
    Skipped,
}

impl CollectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CollectionState::Committed | CollectionState::Failed | CollectionState::Skipped
        )
    }

    pub fn can_advance_to(self, next: CollectionState) -> bool {
        use CollectionState::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Skipped) | (InProgress, Committed) | (InProgress, Failed)
        )
    }
}

/// One collection of a [`RestorePlan`].
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub collection: CollectionRef,
    pub entry: CollectionEntry,
    pub excluded: bool,
}

/// Collections to restore, in manifest order, with exclusion already evaluated.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    entries: Vec<PlanEntry>,
}

impl RestorePlan {
    pub fn from_manifest(manifest: &SnapshotManifest, exclusion: &ExclusionPolicy) -> Self {
        let entries = manifest
            .collections()
            .map(|(collection, entry)| PlanEntry {
                excluded: exclusion.is_excluded(&collection),
                collection,
                entry: entry.clone(),
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn eligible(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| !e.excluded)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub collection: CollectionRef,
    pub state: CollectionState,
    /// Documents in the snapshot for this collection.
    pub expected: u64,
    pub attempted: u64,
    pub inserted: u64,
    pub failed: u64,
    pub elapsed_ms: u64,
    /// First rejected documents (capped).
    pub insert_errors: Vec<InsertError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RestoreOutcome {
    fn new(collection: CollectionRef, expected: u64) -> Self {
        Self {
            collection,
            state: CollectionState::Pending,
            expected,
            attempted: 0,
            inserted: 0,
            failed: 0,
            elapsed_ms: 0,
            insert_errors: Vec::new(),
            error: None,
        }
    }

    fn advance(&mut self, next: CollectionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn record_insert_error(&mut self, error: InsertError) {
        self.failed += 1;
        if self.insert_errors.len() < MAX_REPORTED_INSERT_ERRORS {
            self.insert_errors.push(error);
        }
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed as f64 / self.attempted as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Sorted by collection.
    pub collections: Vec<RestoreOutcome>,
    pub cancelled: bool,
    pub connection_lost: bool,
}

impl RestoreReport {
    pub fn count(&self, state: CollectionState) -> usize {
        self.collections.iter().filter(|c| c.state == state).count()
    }

    pub fn outcome(&self, collection: &CollectionRef) -> Option<&RestoreOutcome> {
        self.collections.iter().find(|c| &c.collection == collection)
    }

    pub fn total_inserted(&self) -> u64 {
        self.collections.iter().map(|c| c.inserted).sum()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled
            && !self.connection_lost
            && self.collections.iter().all(|c| {
                matches!(c.state, CollectionState::Committed | CollectionState::Skipped)
            })
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
        let interrupted = self.collections.iter().filter(|c| !c.state.is_terminal()).count();
        format!(
            "{} committed, {} failed, {} skipped, {} interrupted; {} documents inserted in {}",
            self.count(CollectionState::Committed),
            self.count(CollectionState::Failed),
            self.count(CollectionState::Skipped),
            interrupted,
            self.total_inserted(),
            format_duration(self.elapsed_ms / 1000)
        )
    }
}

enum Interruption {
    None,
    Cancelled,
    ConnectionLost(String),
}

struct RunContext<'a, K: ?Sized> {
    target: &'a K,
    reader: &'a SnapshotReader,
    options: &'a RestoreOptions,
    events: &'a EventBus,
    counters: &'a ProgressCounters,
    token: CancellationToken,
}

pub struct RestoreEngine {
    options: RestoreOptions,
    events: EventBus,
    cancel_token: CancellationToken,
}

impl RestoreEngine {
    pub fn new(options: RestoreOptions) -> Self {
        Self::with_cancel(options, CancellationToken::new())
    }

    pub fn with_cancel(options: RestoreOptions, cancel_token: CancellationToken) -> Self {
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

    /// Restore the snapshot in `dir` into `target`.
    ///
    /// A missing or corrupt manifest fails the run before any write. After
    /// that a report is always returned.
    pub async fn run<K>(&self, target: &K, dir: &Path) -> Result<RestoreReport>
    where
        K: DocumentSink + ?Sized,
    {
        let started = Instant::now();
        let started_at = Utc::now();

        let reader = SnapshotReader::open(dir).await?;
        let plan = RestorePlan::from_manifest(reader.manifest(), &self.options.exclusion);

        let mut outcomes = Vec::new();
        for planned in plan.entries().iter().filter(|e| e.excluded) {
            info!(collection = %planned.collection, "Skipping excluded collection");
            let mut outcome = RestoreOutcome::new(planned.collection.clone(), planned.entry.doc_count);
            outcome.advance(CollectionState::Skipped);
            self.events.emit(VaultEvent::CollectionSkipped {
                collection: planned.collection.clone(),
            });
            outcomes.push(outcome);
        }

        let eligible: Vec<&PlanEntry> = plan.eligible().collect();
        info!(
            collections = eligible.len(),
            skipped = outcomes.len(),
            mode = ?self.options.error_mode,
            "Starting restore"
        );
        self.events.emit(VaultEvent::RestoreStarted {
            collections: eligible.len(),
        });

        let counters = ProgressCounters::new();
        counters.set_total(eligible.len());
        let progress_stop = CancellationToken::new();
        let progress_task = spawn_progress_logger(
            "Restore",
            Arc::clone(&counters),
            self.options.progress_interval,
            progress_stop.clone(),
        );

        let ctx = RunContext {
            target,
            reader: &reader,
            options: &self.options,
            events: &self.events,
            counters: &counters,
            token: self.cancel_token.child_token(),
        };
        let semaphore = Semaphore::new(self.options.max_concurrent_collections.max(1));
        let mut tasks: FuturesUnordered<_> = eligible
            .into_iter()
            .map(|planned| ctx.run_collection(planned, &semaphore))
            .collect();

        let mut cancelled = false;
        let mut connection_lost = false;
        while let Some((outcome, interruption)) = tasks.next().await {
            match interruption {
                Interruption::None => {}
                Interruption::Cancelled => cancelled = true,
                Interruption::ConnectionLost(msg) => {
                    if !connection_lost {
                        error!(error = %msg, "Connection lost, interrupting restore");
                        ctx.token.cancel();
                        connection_lost = true;
                    }
                }
            }
            counters.collection_done();
            outcomes.push(outcome);
        }
        drop(tasks);
        drop(ctx);
        progress_stop.cancel();
        let _ = progress_task.await;

        cancelled |= self.cancel_token.is_cancelled();
        outcomes.sort_by(|a, b| a.collection.cmp(&b.collection));
        let report = RestoreReport {
            dir: dir.to_path_buf(),
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            collections: outcomes,
            cancelled,
            connection_lost,
        };

        self.events.emit(VaultEvent::RunCompleted {
            succeeded: report.count(CollectionState::Committed),
            failed: report.count(CollectionState::Failed),
            skipped: report.count(CollectionState::Skipped),
            cancelled,
        });
        info!("Restore finished: {}", report.summary());
        Ok(report)
    }
}

impl<K: DocumentSink + ?Sized> RunContext<'_, K> {
    async fn run_collection(
        &self,
        planned: &PlanEntry,
        semaphore: &Semaphore,
    ) -> (RestoreOutcome, Interruption) {
        let pending = || {
            (
                RestoreOutcome::new(planned.collection.clone(), planned.entry.doc_count),
                Interruption::Cancelled,
            )
        };

        if self.token.is_cancelled() {
            return pending();
        }
        let _permit = tokio::select! {
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return pending(),
            },
            _ = self.token.cancelled() => return pending(),
        };
        if self.token.is_cancelled() {
            return pending();
        }

        self.restore_collection(planned).await
    }

    async fn restore_collection(&self, planned: &PlanEntry) -> (RestoreOutcome, Interruption) {
        let started = Instant::now();
        let collection = &planned.collection;
        let mut outcome = RestoreOutcome::new(collection.clone(), planned.entry.doc_count);
        outcome.advance(CollectionState::InProgress);

        info!(collection = %collection, documents = planned.entry.doc_count, "Restoring collection");
        self.events.emit(VaultEvent::CollectionStarted {
            collection: collection.clone(),
        });

        let interruption = self.insert_all(planned, &mut outcome).await;
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;

        match interruption {
            Interruption::None => {}
            other => return (outcome, other),
        }

        if outcome.state == CollectionState::InProgress {
            let ratio = outcome.failure_ratio();
            if outcome.failed > 0 && ratio > self.options.max_failure_ratio {
                let reason = format!(
                    "{} of {} documents rejected ({:.2}% > {:.2}% allowed)",
                    outcome.failed,
                    outcome.attempted,
                    ratio * 100.0,
                    self.options.max_failure_ratio * 100.0
                );
                self.fail(&mut outcome, reason);
            } else {
                if outcome.failed > 0 {
                    warn!(
                        collection = %collection,
                        rejected = outcome.failed,
                        "Collection restored with rejected documents"
                    );
                }
                outcome.advance(CollectionState::Committed);
                info!(collection = %collection, inserted = outcome.inserted, "Collection restored");
                self.events.emit(VaultEvent::CollectionCommitted {
                    collection: collection.clone(),
                    doc_count: outcome.inserted,
                    resumed: false,
                });
            }
        }
        (outcome, Interruption::None)
    }

    /// Insert every chunk. Leaves `outcome` `InProgress` unless the collection
    /// already failed; the caller applies the failure ratio.
    async fn insert_all(&self, planned: &PlanEntry, outcome: &mut RestoreOutcome) -> Interruption {
        let collection = &planned.collection;

        if let Err(e) = self.target.ensure_collection(collection).await {
            if e.is_connection() {
                return Interruption::ConnectionLost(e.to_string());
            }
            self.fail(outcome, e.to_string());
            return Interruption::None;
        }

        let ordered = self.options.error_mode == ErrorMode::Stop;
        let batch_size = self.options.insert_batch_size.max(1);
        let mut stream = self.reader.stream_documents(collection, &planned.entry);

        loop {
            if self.token.is_cancelled() {
                return Interruption::Cancelled;
            }
            let documents = match stream.next_chunk().await {
                Ok(Some(documents)) => documents,
                Ok(None) => return Interruption::None,
                Err(e) => {
                    self.fail(outcome, e.to_string());
                    return Interruption::None;
                }
            };

            let mut documents = documents.into_iter().peekable();
            while documents.peek().is_some() {
                if self.token.is_cancelled() {
                    return Interruption::Cancelled;
                }
                let batch: Vec<_> = documents.by_ref().take(batch_size).collect();
                let base = outcome.attempted;
                let ids: Vec<Option<String>> =
                    batch.iter().map(|d| d.id().map(render_value)).collect();
                let len = batch.len() as u64;

                let result = match self.target.insert_batch(collection, batch, ordered).await {
                    Ok(result) => result,
                    Err(e) if e.is_connection() => {
                        return Interruption::ConnectionLost(e.to_string());
                    }
                    Err(e) => {
                        self.fail(outcome, e.to_string());
                        return Interruption::None;
                    }
                };

                outcome.inserted += result.inserted as u64;
                self.counters.add_documents(result.inserted as u64);
                outcome.attempted += if ordered {
                    result.inserted as u64 + result.failures.len() as u64
                } else {
                    len
                };
                for (offset, reason) in result.failures {
                    outcome.record_insert_error(InsertError {
                        index: base + offset as u64,
                        document_id: ids.get(offset).cloned().flatten(),
                        reason,
                    });
                }

                if ordered && outcome.failed > 0 {
                    let first = outcome
                        .insert_errors
                        .first()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    self.fail(outcome, format!("stopped at first rejected document: {first}"));
                    return Interruption::None;
                }
            }
        }
    }

    fn fail(&self, outcome: &mut RestoreOutcome, reason: String) {
        warn!(collection = %outcome.collection, error = %reason, "Collection restore failed");
        self.events.emit(VaultEvent::CollectionFailed {
            collection: outcome.collection.clone(),
            error: reason.clone(),
        });
        outcome.error = Some(reason);
        outcome.advance(CollectionState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupOptions, BackupOrchestrator};
    use crate::document::Document;
    use crate::source::MemoryStore;
    use crate::utils::VaultError;
    use tempfile::TempDir;

    fn docs(n: i64) -> Vec<Document> {
        (0..n).map(|i| Document::new().with("_id", i).with("v", i * 2)).collect()
    }

    async fn snapshot_of(store: &MemoryStore, dir: &Path) {
        let options = BackupOptions {
            exclusion: ExclusionPolicy::none(),
            ..BackupOptions::default()
        };
        let report = BackupOrchestrator::new(options).run(store, dir).await.unwrap();
        assert!(report.is_success());
    }

    #[test]
    fn test_state_transitions() {
        use CollectionState::*;
        assert!(Pending.can_advance_to(InProgress));
        assert!(Pending.can_advance_to(Skipped));
        assert!(InProgress.can_advance_to(Committed));
        assert!(InProgress.can_advance_to(Failed));
        assert!(!Pending.can_advance_to(Committed));
        assert!(!Skipped.can_advance_to(InProgress));
        assert!(!Committed.can_advance_to(Failed));
        assert!(Skipped.is_terminal() && !InProgress.is_terminal());
    }

    #[tokio::test]
    async fn test_restore_into_empty_target() {
        let temp = TempDir::new().unwrap();
        let source = MemoryStore::new();
        let orders = CollectionRef::new("shop", "orders");
        source.put(&orders, docs(25)).await;
        snapshot_of(&source, temp.path()).await;

        let target = MemoryStore::new();
        let options = RestoreOptions {
            insert_batch_size: 7,
            ..RestoreOptions::default()
        };
        let report = RestoreEngine::new(options).run(&target, temp.path()).await.unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.outcome(&orders).unwrap().inserted, 25);
        assert_eq!(target.documents(&orders).await.unwrap(), docs(25));
    }

    #[tokio::test]
    async fn test_continue_mode_respects_failure_ratio() {
        let temp = TempDir::new().unwrap();
        let source = MemoryStore::new();
        let orders = CollectionRef::new("shop", "orders");
        source.put(&orders, docs(10)).await;
        snapshot_of(&source, temp.path()).await;

        // Two of the ten documents already exist in the target.
        let target = MemoryStore::new();
        target.put(&orders, docs(2)).await;

        let strict = RestoreEngine::new(RestoreOptions::default())
            .run(&target, temp.path())
            .await
            .unwrap();
        let outcome = strict.outcome(&orders).unwrap();
        assert_eq!(outcome.state, CollectionState::Failed);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.inserted, 8);
        assert_eq!(outcome.insert_errors[0].index, 0);
        assert_eq!(outcome.insert_errors[0].document_id.as_deref(), Some("0"));
        assert_eq!(strict.exit_code(), 1);

        // Re-running with a tolerant ratio: all ten are now duplicates.
        let tolerant = RestoreOptions {
            max_failure_ratio: 1.0,
            ..RestoreOptions::default()
        };
        let report = RestoreEngine::new(tolerant).run(&target, temp.path()).await.unwrap();
        let outcome = report.outcome(&orders).unwrap();
        assert_eq!(outcome.state, CollectionState::Committed);
        assert_eq!(outcome.failed, 10);
        assert_eq!(target.documents(&orders).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_stop_mode_fails_on_first_rejection() {
        let temp = TempDir::new().unwrap();
        let source = MemoryStore::new();
        let orders = CollectionRef::new("shop", "orders");
        source.put(&orders, docs(5)).await;
        snapshot_of(&source, temp.path()).await;

        let target = MemoryStore::new();
        target.put(&orders, vec![Document::new().with("_id", 2)]).await;

        let options = RestoreOptions {
            error_mode: ErrorMode::Stop,
            ..RestoreOptions::default()
        };
        let report = RestoreEngine::new(options).run(&target, temp.path()).await.unwrap();
        let outcome = report.outcome(&orders).unwrap();

        assert_eq!(outcome.state, CollectionState::Failed);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.attempted, 3);
        assert!(outcome.error.as_deref().unwrap().contains("document #2"));
    }

    #[tokio::test]
    async fn test_excluded_collections_are_skipped_without_writes() {
        let temp = TempDir::new().unwrap();
        let source = MemoryStore::new();
        let version = CollectionRef::new("admin", "system.version");
        source.put(&version, docs(1)).await;
        source.put(&CollectionRef::new("shop", "carts"), Vec::new()).await;
        snapshot_of(&source, temp.path()).await;

        let target = MemoryStore::new();
        let report = RestoreEngine::new(RestoreOptions::default())
            .run(&target, temp.path())
            .await
            .unwrap();

        assert_eq!(report.outcome(&version).unwrap().state, CollectionState::Skipped);
        assert!(target.documents(&version).await.is_none());
        let carts = CollectionRef::new("shop", "carts");
        assert_eq!(report.outcome(&carts).unwrap().state, CollectionState::Committed);
        assert_eq!(target.documents(&carts).await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_fatal() {
        let temp = TempDir::new().unwrap();
        let err = RestoreEngine::new(RestoreOptions::default())
            .run(&MemoryStore::new(), &temp.path().join("nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ManifestMissing(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_offline_target_is_connection_failure() {
        let temp = TempDir::new().unwrap();
        let source = MemoryStore::new();
        source.put(&CollectionRef::new("shop", "orders"), docs(3)).await;
        snapshot_of(&source, temp.path()).await;

        let target = MemoryStore::new();
        target.set_offline(true);
        let report = RestoreEngine::new(RestoreOptions::default())
            .run(&target, temp.path())
            .await
            .unwrap();

        assert!(report.connection_lost);
        assert_eq!(report.exit_code(), 2);
    }
}
