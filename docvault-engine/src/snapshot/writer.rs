//! Snapshot writer.
//!
//! Chunks are first staged under `<dir>/.partial/<db>__<coll>/NNNNNN.chunk`
//! and only published (renamed into `<dir>`) when their collection commits.
//! A commit goes through three durable steps:
//!
//! 1. `<key>/entry.json` records the final entry (commit intent)
//! 2. staged chunks are renamed to their published names
//! 3. `committed/<key>.json` records the commit, the staging dir is removed
//!
//! A crash between 1 and 3 is rolled forward by [`SnapshotWriter::resume`].
//! `run.json` pins the settings of the run so a resume cannot mix formats.
//! [`SnapshotWriter::finish`] writes `manifest.json` and removes `.partial`.

use super::chunk::{encode_chunk, read_header, Compression};
use super::manifest::{ChunkFile, CollectionEntry, SnapshotManifest};
use super::naming::{
    chunk_file_name, collection_key, parse_staged_chunk_name, staged_chunk_name, MANIFEST_FILE,
    STAGING_DIR,
};
use super::{sync_dir, tmp_path, write_atomic_blocking};
use crate::document::{encode_line, Document, Fidelity};
use crate::source::{CollectionRef, CursorToken, ResumePoint};
use crate::utils::WriteError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const RUN_FILE: &str = "run.json";
const COMMITTED_DIR: &str = "committed";
const INTENT_FILE: &str = "entry.json";

/// Chunking and encoding settings for a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    pub max_chunk_documents: usize,
    pub max_chunk_bytes: u64,
    pub compression: Compression,
    pub compression_level: i32,
    pub fidelity: Fidelity,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_chunk_documents: 10_000,
            max_chunk_bytes: 64 * 1024 * 1024,
            compression: Compression::Zstd,
            compression_level: 3,
            fidelity: Fidelity::Canonical,
        }
    }
}

/// Issues strictly increasing capture timestamps, even if the wall clock
/// stalls or steps backwards.
#[derive(Debug, Default)]
pub struct CaptureClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl CaptureClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose first reading is later than `after`.
    pub fn starting_after(after: DateTime<Utc>) -> Self {
        Self {
            last: Mutex::new(Some(after)),
        }
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = match *last {
            Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRecord {
    fidelity: Fidelity,
    compression: Compression,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitRecord {
    database: String,
    collection: String,
    entry: CollectionEntry,
}

impl CommitRecord {
    fn collection_ref(&self) -> CollectionRef {
        CollectionRef::new(self.database.clone(), self.collection.clone())
    }
}

#[derive(Debug)]
struct Shared {
    dir: PathBuf,
    staging: PathBuf,
    options: WriterOptions,
    clock: CaptureClock,
    committed: Mutex<BTreeMap<CollectionRef, CollectionEntry>>,
    open: Mutex<HashSet<CollectionRef>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn collection_staging(&self, collection: &CollectionRef) -> PathBuf {
        self.staging.join(collection_key(collection))
    }

    fn committed_record(&self, collection: &CollectionRef) -> PathBuf {
        self.staging
            .join(COMMITTED_DIR)
            .join(format!("{}.json", collection_key(collection)))
    }

    fn release(&self, collection: &CollectionRef) {
        locked(&self.open).remove(collection);
    }
}

async fn blocking<T, F>(f: F) -> Result<T, WriteError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WriteError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WriteError::Task(e.to_string()))?
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), WriteError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| WriteError::Encode(e.to_string()))?;
    write_atomic_blocking(path, &bytes)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, WriteError> {
    let bytes = fs::read(path).map_err(|e| WriteError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        WriteError::ResumeMismatch(format!("unreadable {}: {}", path.display(), e))
    })
}

fn remove_dir_if_exists(path: &Path) -> Result<(), WriteError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WriteError::io(path, e)),
    }
}

/// Staged chunk indexes in a collection staging dir, sorted; temp files are removed.
fn staged_chunks(dir: &Path) -> Result<Vec<usize>, WriteError> {
    let mut indexes = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indexes),
        Err(e) => return Err(WriteError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| WriteError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".tmp") {
            fs::remove_file(entry.path()).map_err(|e| WriteError::io(entry.path(), e))?;
        } else if let Some(index) = parse_staged_chunk_name(&name) {
            indexes.push(index);
        }
    }
    indexes.sort_unstable();
    Ok(indexes)
}

/// Finish an interrupted commit: publish whatever chunks are still staged
/// and record the commit.
fn roll_forward(shared: &Shared, record: &CommitRecord) -> Result<(), WriteError> {
    let collection = record.collection_ref();
    let staging = shared.collection_staging(&collection);
    for (index, chunk) in record.entry.chunk_files.iter().enumerate() {
        let staged = staging.join(staged_chunk_name(index));
        let published = shared.dir.join(&chunk.file);
        if staged.exists() {
            fs::rename(&staged, &published).map_err(|e| WriteError::io(&published, e))?;
        } else if !published.exists() {
            return Err(WriteError::ResumeMismatch(format!(
                "chunk {} of {} is neither staged nor published",
                chunk.file, collection
            )));
        }
    }
    sync_dir(&shared.dir).map_err(|e| WriteError::io(&shared.dir, e))?;
    write_json(&shared.committed_record(&collection), record)?;
    remove_dir_if_exists(&staging)?;
    Ok(())
}

/// Result of [`SnapshotWriter::open_collection`].
#[derive(Debug)]
pub enum OpenedCollection {
    /// Already committed by an earlier attempt; nothing to read.
    Committed(CollectionEntry),
    /// Staged chunks survive; continue reading from `resume`.
    Partial {
        handle: WriteHandle,
        resume: ResumePoint,
    },
    Fresh(WriteHandle),
}

/// Writes a snapshot directory. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    shared: Arc<Shared>,
}

impl SnapshotWriter {
    /// Start a new snapshot in `dir`, which must not hold a finished or an
    /// unfinished snapshot.
    pub async fn create(dir: impl AsRef<Path>, options: WriterOptions) -> Result<Self, WriteError> {
        let dir = dir.as_ref().to_path_buf();
        let staging = dir.join(STAGING_DIR);

        let shared = blocking({
            let dir = dir.clone();
            let staging = staging.clone();
            let options = options.clone();
            move || {
                if dir.join(MANIFEST_FILE).exists() {
                    return Err(WriteError::SnapshotExists(dir));
                }
                if staging.exists() {
                    return Err(WriteError::StagingExists(dir));
                }
                fs::create_dir_all(staging.join(COMMITTED_DIR))
                    .map_err(|e| WriteError::io(&staging, e))?;
                let run = RunRecord {
                    fidelity: options.fidelity,
                    compression: options.compression,
                    started_at: Utc::now(),
                };
                write_json(&staging.join(RUN_FILE), &run)?;
                sync_dir(&dir).map_err(|e| WriteError::io(&dir, e))?;
                Ok(Shared {
                    dir,
                    staging,
                    options,
                    clock: CaptureClock::new(),
                    committed: Mutex::new(BTreeMap::new()),
                    open: Mutex::new(HashSet::new()),
                })
            }
        })
        .await?;

        info!(dir = %shared.dir.display(), "Started snapshot");
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Continue an interrupted snapshot in `dir`. Interrupted commits are
    /// rolled forward. Without a staging area this is the same as [`create`].
    ///
    /// [`create`]: SnapshotWriter::create
    pub async fn resume(dir: impl AsRef<Path>, options: WriterOptions) -> Result<Self, WriteError> {
        let dir = dir.as_ref().to_path_buf();
        let staging = dir.join(STAGING_DIR);

        if dir.join(MANIFEST_FILE).exists() {
            return Err(WriteError::SnapshotExists(dir));
        }
        if !staging.exists() {
            info!(dir = %dir.display(), "Nothing to resume, starting a new snapshot");
            return Self::create(dir, options).await;
        }

        let shared = blocking(move || {
            let run: RunRecord = read_json(&staging.join(RUN_FILE))?;
            if run.fidelity != options.fidelity || run.compression != options.compression {
                return Err(WriteError::ResumeMismatch(format!(
                    "snapshot was started with fidelity={} compression={}, now fidelity={} compression={}",
                    run.fidelity, run.compression, options.fidelity, options.compression
                )));
            }

            let mut shared = Shared {
                dir,
                staging,
                options,
                clock: CaptureClock::new(),
                committed: Mutex::new(BTreeMap::new()),
                open: Mutex::new(HashSet::new()),
            };

            let committed_dir = shared.staging.join(COMMITTED_DIR);
            fs::create_dir_all(&committed_dir).map_err(|e| WriteError::io(&committed_dir, e))?;

            // Interrupted commits first, so their records exist below.
            let entries = fs::read_dir(&shared.staging).map_err(|e| WriteError::io(&shared.staging, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| WriteError::io(&shared.staging, e))?;
                let intent = entry.path().join(INTENT_FILE);
                if intent.is_file() {
                    let record: CommitRecord = read_json(&intent)?;
                    info!(collection = %record.collection_ref(), "Rolling forward interrupted commit");
                    roll_forward(&shared, &record)?;
                }
            }

            let mut committed = BTreeMap::new();
            let mut latest = None;
            let records = fs::read_dir(&committed_dir).map_err(|e| WriteError::io(&committed_dir, e))?;
            for entry in records {
                let path = entry.map_err(|e| WriteError::io(&committed_dir, e))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let record: CommitRecord = read_json(&path)?;
                latest = latest.max(Some(record.entry.timestamp_captured_at));
                committed.insert(record.collection_ref(), record.entry);
            }
            if let Some(latest) = latest {
                shared.clock = CaptureClock::starting_after(latest);
            }
            shared.committed = Mutex::new(committed);
            Ok(shared)
        })
        .await?;

        info!(
            dir = %shared.dir.display(),
            committed = locked(&shared.committed).len(),
            "Resuming snapshot"
        );
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn options(&self) -> &WriterOptions {
        &self.shared.options
    }

    /// Collections committed so far, including those from earlier attempts.
    pub fn committed(&self) -> Vec<(CollectionRef, CollectionEntry)> {
        locked(&self.shared.committed)
            .iter()
            .map(|(c, e)| (c.clone(), e.clone()))
            .collect()
    }

    fn claim(&self, collection: &CollectionRef) -> Result<(), WriteError> {
        if locked(&self.shared.committed).contains_key(collection) {
            return Err(WriteError::AlreadyCommitted(collection.clone()));
        }
        if !locked(&self.shared.open).insert(collection.clone()) {
            return Err(WriteError::Task(format!("{collection} is already being written")));
        }
        Ok(())
    }

    /// Open a collection for writing, picking up whatever an earlier attempt
    /// left behind.
    pub async fn open_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<OpenedCollection, WriteError> {
        if let Some(entry) = locked(&self.shared.committed).get(collection) {
            return Ok(OpenedCollection::Committed(entry.clone()));
        }
        self.claim(collection)?;

        let shared = Arc::clone(&self.shared);
        let coll = collection.clone();
        let staged = blocking(move || load_staged(&shared, &coll)).await;
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                self.shared.release(collection);
                return Err(e);
            }
        };

        let mut handle = WriteHandle::new(Arc::clone(&self.shared), collection.clone());
        match staged {
            None => Ok(OpenedCollection::Fresh(handle)),
            Some((chunks, resume)) => {
                info!(
                    collection = %collection,
                    chunks = chunks.len(),
                    "Continuing from staged chunks"
                );
                handle.doc_count = chunks.iter().map(|c| c.doc_count).sum();
                handle.chunks = chunks;
                handle.page_origin = resume.token.clone();
                handle.page_consumed = resume.skip;
                Ok(OpenedCollection::Partial { handle, resume })
            }
        }
    }

    /// Open a collection from scratch, discarding any staged chunks.
    pub async fn begin_collection(&self, collection: &CollectionRef) -> Result<WriteHandle, WriteError> {
        self.claim(collection)?;
        let staging = self.shared.collection_staging(collection);
        if let Err(e) = blocking(move || remove_dir_if_exists(&staging)).await {
            self.shared.release(collection);
            return Err(e);
        }
        Ok(WriteHandle::new(Arc::clone(&self.shared), collection.clone()))
    }

    /// Drop a committed collection from the snapshot, removing its published chunks.
    pub async fn discard_committed(&self, collection: &CollectionRef) -> Result<bool, WriteError> {
        let Some(entry) = locked(&self.shared.committed).remove(collection) else {
            return Ok(false);
        };
        let shared = Arc::clone(&self.shared);
        let record = shared.committed_record(collection);
        blocking(move || {
            for chunk in &entry.chunk_files {
                let path = shared.dir.join(&chunk.file);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(WriteError::io(&path, e)),
                }
            }
            match fs::remove_file(&record) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(WriteError::io(&record, e)),
            }
        })
        .await?;
        info!(collection = %collection, "Discarded committed collection");
        Ok(true)
    }

    /// Write the manifest for every committed collection and remove the
    /// staging area. All handles must be closed.
    pub async fn finish(self) -> Result<SnapshotManifest, WriteError> {
        let open = locked(&self.shared.open).len();
        if open > 0 {
            return Err(WriteError::Task(format!(
                "{open} collection(s) still open at finish"
            )));
        }

        let options = &self.shared.options;
        let mut manifest = SnapshotManifest::new(options.fidelity, options.compression, Utc::now());
        for (collection, entry) in self.committed() {
            manifest.insert(&collection, entry)?;
        }
        manifest.write(&self.shared.dir).await?;

        let staging = self.shared.staging.clone();
        let dir = self.shared.dir.clone();
        blocking(move || {
            remove_dir_if_exists(&staging)?;
            sync_dir(&dir).map_err(|e| WriteError::io(&dir, e))
        })
        .await?;

        info!(
            dir = %self.shared.dir.display(),
            collections = manifest.collection_count(),
            documents = manifest.total_documents(),
            "Snapshot manifest written"
        );
        Ok(manifest)
    }
}

/// Recover the staged chunks of an uncommitted collection. Chunks after the
/// first unreadable or missing index are discarded.
fn load_staged(
    shared: &Shared,
    collection: &CollectionRef,
) -> Result<Option<(Vec<ChunkFile>, ResumePoint)>, WriteError> {
    let dir = shared.collection_staging(collection);
    let mut chunks = Vec::new();
    let mut resume = None;
    let mut broken = false;

    for (expected, index) in staged_chunks(&dir)?.into_iter().enumerate() {
        let path = dir.join(staged_chunk_name(index));
        let header = if !broken && index == expected {
            let name = path.display().to_string();
            fs::read(&path)
                .ok()
                .and_then(|bytes| read_header(&name, &bytes).ok().map(|h| (h, bytes.len())))
                .filter(|(h, _)| h.collection_ref() == *collection && h.index == index)
        } else {
            None
        };

        match header {
            Some((header, len)) => {
                chunks.push(ChunkFile {
                    file: chunk_file_name(collection, index),
                    doc_count: header.doc_count,
                    bytes: len as u64,
                    checksum: header.checksum,
                });
                resume = Some(header.resume);
            }
            None => {
                broken = true;
                warn!(collection = %collection, chunk = index, "Discarding unusable staged chunk");
                fs::remove_file(&path).map_err(|e| WriteError::io(&path, e))?;
            }
        }
    }

    Ok(resume.map(|resume| (chunks, resume)))
}

/// An open collection. Commit publishes it; abort, suspend or drop publish nothing.
#[derive(Debug)]
pub struct WriteHandle {
    shared: Arc<Shared>,
    collection: CollectionRef,
    buffer: Vec<u8>,
    buffered_docs: u64,
    chunks: Vec<ChunkFile>,
    doc_count: u64,
    page_origin: Option<CursorToken>,
    page_consumed: u64,
    closed: bool,
}

impl WriteHandle {
    fn new(shared: Arc<Shared>, collection: CollectionRef) -> Self {
        Self {
            shared,
            collection,
            buffer: Vec::new(),
            buffered_docs: 0,
            chunks: Vec::new(),
            doc_count: 0,
            page_origin: None,
            page_consumed: 0,
            closed: false,
        }
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    /// Documents appended so far, including those in staged chunks.
    pub fn doc_count(&self) -> u64 {
        self.doc_count + self.buffered_docs
    }

    pub fn chunks(&self) -> &[ChunkFile] {
        &self.chunks
    }

    /// Record that the documents appended next come from the page fetched at
    /// `origin`, after `skipped` documents of it were discarded.
    pub fn mark_position(&mut self, origin: Option<CursorToken>, skipped: u64) {
        self.page_origin = origin;
        self.page_consumed = skipped;
    }

    fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            token: self.page_origin.clone(),
            skip: self.page_consumed,
        }
    }

    /// Buffer a document, flushing a chunk when a threshold is reached.
    /// Returns the chunk flushed by this call, if any.
    pub async fn append(&mut self, doc: &Document) -> Result<Option<ChunkFile>, WriteError> {
        let line = encode_line(doc, self.shared.options.fidelity)
            .map_err(|e| WriteError::Encode(e.to_string()))?;

        let mut flushed = None;
        let projected = self.buffer.len() as u64 + line.len() as u64 + 1;
        if self.buffered_docs > 0 && projected > self.shared.options.max_chunk_bytes {
            flushed = Some(self.flush().await?);
        }

        self.buffer.extend_from_slice(&line);
        self.buffer.push(b'\n');
        self.buffered_docs += 1;
        self.page_consumed += 1;

        if self.buffered_docs >= self.shared.options.max_chunk_documents as u64 {
            flushed = Some(self.flush().await?);
        }
        Ok(flushed)
    }

    /// Durably stage the buffered documents as the next chunk.
    async fn flush(&mut self) -> Result<ChunkFile, WriteError> {
        let index = self.chunks.len();
        let body = std::mem::take(&mut self.buffer);
        let doc_count = std::mem::take(&mut self.buffered_docs);
        let resume = self.resume_point();
        let collection = self.collection.clone();
        let shared = Arc::clone(&self.shared);

        let chunk = blocking(move || {
            let options = &shared.options;
            let (header, bytes) = encode_chunk(
                &collection,
                index,
                doc_count,
                &body,
                options.compression,
                options.compression_level,
                resume,
            )?;

            let dir = shared.collection_staging(&collection);
            fs::create_dir_all(&dir).map_err(|e| WriteError::io(&dir, e))?;
            write_atomic_blocking(&dir.join(staged_chunk_name(index)), &bytes)?;

            Ok(ChunkFile {
                file: chunk_file_name(&collection, index),
                doc_count,
                bytes: bytes.len() as u64,
                checksum: header.checksum,
            })
        })
        .await?;

        debug!(
            collection = %self.collection,
            chunk = index,
            documents = chunk.doc_count,
            bytes = chunk.bytes,
            "Chunk flushed"
        );
        self.doc_count += chunk.doc_count;
        self.chunks.push(chunk.clone());
        Ok(chunk)
    }

    /// Flush the remainder, publish every chunk and record the collection.
    pub async fn commit(mut self) -> Result<CollectionEntry, WriteError> {
        if self.buffered_docs > 0 {
            self.flush().await?;
        }

        let entry = CollectionEntry {
            name: self.collection.collection().to_string(),
            chunk_files: self.chunks.clone(),
            doc_count: self.doc_count,
            timestamp_captured_at: self.shared.clock.next(),
        };
        let record = CommitRecord {
            database: self.collection.database().to_string(),
            collection: self.collection.collection().to_string(),
            entry: entry.clone(),
        };

        let shared = Arc::clone(&self.shared);
        blocking(move || {
            let staging = shared.collection_staging(&record.collection_ref());
            fs::create_dir_all(&staging).map_err(|e| WriteError::io(&staging, e))?;
            write_json(&staging.join(INTENT_FILE), &record)?;
            roll_forward(&shared, &record)
        })
        .await?;

        locked(&self.shared.committed).insert(self.collection.clone(), entry.clone());
        self.close();
        info!(
            collection = %self.collection,
            documents = entry.doc_count,
            chunks = entry.chunk_files.len(),
            "Collection committed"
        );
        Ok(entry)
    }

    /// Discard everything staged for this collection.
    pub async fn abort(mut self) -> Result<(), WriteError> {
        let staging = self.shared.collection_staging(&self.collection);
        self.close();
        blocking(move || remove_dir_if_exists(&staging)).await?;
        debug!(collection = %self.collection, "Staged chunks discarded");
        Ok(())
    }

    /// Close without publishing, keeping staged chunks for a later resume.
    /// Buffered documents not yet in a chunk are dropped; they are re-read on resume.
    pub fn suspend(mut self) {
        debug!(
            collection = %self.collection,
            staged_chunks = self.chunks.len(),
            "Collection suspended"
        );
        self.close();
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.release(&self.collection);
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        self.close();
    }
}
