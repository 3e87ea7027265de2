//! Document sources and restore targets.
//!
//! A [`DocumentSource`] enumerates databases and collections and serves
//! documents in pages addressed by opaque [`CursorToken`]s, which lets an
//! interrupted dump continue where its last durable chunk ended. A
//! [`DocumentSink`] is the write side used by restore.
//!
//! Connections are plain values handed to the orchestrator by reference; they
//! are released when the caller drops them at the end of an operation.

pub mod fs;
pub mod memory;

use crate::document::Document;
use crate::utils::{SinkError, SourceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// A (database, collection) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionRef {
    database: String,
    collection: String,
}

impl CollectionRef {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Opaque position inside a collection, issued by the source that served it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorToken(String);

impl CursorToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of documents. `next` is `None` once the collection is exhausted.
#[derive(Debug, Clone, Default)]
pub struct DocumentBatch {
    pub documents: Vec<Document>,
    pub next: Option<CursorToken>,
}

/// Read side of a document store.
pub trait DocumentSource: Send + Sync {
    /// Fails with [`SourceError::Connection`] when the server is unreachable.
    fn list_databases(&self) -> impl Future<Output = Result<Vec<String>, SourceError>> + Send;

    fn list_collections(
        &self,
        database: &str,
    ) -> impl Future<Output = Result<Vec<String>, SourceError>> + Send;

    /// Fetch at most `limit` documents starting at `cursor` (`None` = beginning).
    fn fetch_batch(
        &self,
        collection: &CollectionRef,
        cursor: Option<&CursorToken>,
        limit: usize,
    ) -> impl Future<Output = Result<DocumentBatch, SourceError>> + Send;
}

/// Result of one [`DocumentSink::insert_batch`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    pub inserted: usize,
    /// (offset within the batch, reason) for each rejected document.
    pub failures: Vec<(usize, String)>,
}

/// Write side of a document store.
pub trait DocumentSink: Send + Sync {
    /// Create the collection if it does not exist yet.
    fn ensure_collection(
        &self,
        collection: &CollectionRef,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Insert documents in order. With `ordered`, the first rejected document
    /// stops the batch; otherwise every document is attempted.
    fn insert_batch(
        &self,
        collection: &CollectionRef,
        documents: Vec<Document>,
        ordered: bool,
    ) -> impl Future<Output = Result<InsertOutcome, SinkError>> + Send;
}

/// Where a cursor (re)starts: fetch from `token`, then discard `skip` documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub token: Option<CursorToken>,
    pub skip: u64,
}

/// A page returned by [`SourceCursor::next_batch`].
#[derive(Debug, Clone)]
pub struct CursorBatch {
    /// Token the page was fetched from.
    pub origin: Option<CursorToken>,
    /// Documents at the start of the page that were discarded while resuming.
    pub skipped: u64,
    pub documents: Vec<Document>,
}

/// Lazy, restartable sequence of documents for one collection.
pub struct SourceCursor<'a, S: DocumentSource + ?Sized> {
    source: &'a S,
    collection: CollectionRef,
    position: Option<CursorToken>,
    pending_skip: u64,
    batch_size: usize,
    exhausted: bool,
}

impl<'a, S: DocumentSource + ?Sized> SourceCursor<'a, S> {
    pub fn next_position(&self) -> Option<&CursorToken> {
        self.position.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Pull the next non-empty page, or `None` at the end of the collection.
    pub async fn next_batch(&mut self) -> Result<Option<CursorBatch>, SourceError> {
        while !self.exhausted {
            let origin = self.position.clone();
            let batch = self
                .source
                .fetch_batch(&self.collection, origin.as_ref(), self.batch_size)
                .await?;

            let progressed = batch.next != origin;
            self.exhausted = batch.next.is_none() || !progressed;
            self.position = batch.next;

            let mut documents = batch.documents;
            let skipped = (self.pending_skip as usize).min(documents.len());
            documents.drain(..skipped);
            self.pending_skip -= skipped as u64;

            if !documents.is_empty() {
                return Ok(Some(CursorBatch {
                    origin,
                    skipped: skipped as u64,
                    documents,
                }));
            }
        }
        Ok(None)
    }
}

/// Open a cursor over `collection`, optionally continuing from `resume`.
pub fn stream_documents<'a, S: DocumentSource + ?Sized>(
    source: &'a S,
    collection: CollectionRef,
    resume: Option<ResumePoint>,
    batch_size: usize,
) -> SourceCursor<'a, S> {
    let resume = resume.unwrap_or_default();
    SourceCursor {
        source,
        collection,
        position: resume.token,
        pending_skip: resume.skip,
        batch_size: batch_size.max(1),
        exhausted: false,
    }
}

/// A store selected at runtime from a connection URI.
#[derive(Debug)]
pub enum AnyStore {
    Memory(MemoryStore),
    Fs(FsStore),
}

/// Connect to a store by URI.
///
/// Supported schemes: `file://<dir>` (a [`FsStore`]) and `mem://` (an empty
/// [`MemoryStore`]). With `create`, a missing `file://` root is created, which
/// is what a restore target wants.
pub async fn connect(uri: &str, create: bool) -> Result<AnyStore, SourceError> {
    if let Some(path) = uri.strip_prefix("file://") {
        let store = if create {
            FsStore::create(path).await?
        } else {
            FsStore::open(path).await?
        };
        Ok(AnyStore::Fs(store))
    } else if uri.starts_with("mem://") {
        Ok(AnyStore::Memory(MemoryStore::new()))
    } else {
        Err(SourceError::Connection(format!(
            "unsupported connection URI {uri:?} (expected file:// or mem://)"
        )))
    }
}

impl DocumentSource for AnyStore {
    async fn list_databases(&self) -> Result<Vec<String>, SourceError> {
        match self {
            AnyStore::Memory(s) => s.list_databases().await,
            AnyStore::Fs(s) => s.list_databases().await,
        }
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, SourceError> {
        match self {
            AnyStore::Memory(s) => s.list_collections(database).await,
            AnyStore::Fs(s) => s.list_collections(database).await,
        }
    }

    async fn fetch_batch(
        &self,
        collection: &CollectionRef,
        cursor: Option<&CursorToken>,
        limit: usize,
    ) -> Result<DocumentBatch, SourceError> {
        match self {
            AnyStore::Memory(s) => s.fetch_batch(collection, cursor, limit).await,
            AnyStore::Fs(s) => s.fetch_batch(collection, cursor, limit).await,
        }
    }
}

impl DocumentSink for AnyStore {
    async fn ensure_collection(&self, collection: &CollectionRef) -> Result<(), SinkError> {
        match self {
            AnyStore::Memory(s) => s.ensure_collection(collection).await,
            AnyStore::Fs(s) => s.ensure_collection(collection).await,
        }
    }

    async fn insert_batch(
        &self,
        collection: &CollectionRef,
        documents: Vec<Document>,
        ordered: bool,
    ) -> Result<InsertOutcome, SinkError> {
        match self {
            AnyStore::Memory(s) => s.insert_batch(collection, documents, ordered).await,
            AnyStore::Fs(s) => s.insert_batch(collection, documents, ordered).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: i64) -> Vec<Document> {
        (0..n).map(|i| Document::new().with("_id", i)).collect()
    }

    fn ids(docs: &[Document]) -> Vec<i64> {
        docs.iter().filter_map(|d| d.id().and_then(|v| v.as_i64())).collect()
    }

    #[tokio::test]
    async fn test_cursor_reads_everything_in_order() {
        let store = MemoryStore::new();
        let coll = CollectionRef::new("shop", "orders");
        store.put(&coll, numbered(7)).await;

        let mut cursor = stream_documents(&store, coll, None, 3);
        let mut seen = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            seen.extend(batch.documents);
        }

        assert_eq!(ids(&seen), vec![0, 1, 2, 3, 4, 5, 6]);
        assert!(cursor.is_exhausted());
    }

    #[tokio::test]
    async fn test_cursor_resume_skips_already_written_documents() {
        let store = MemoryStore::new();
        let coll = CollectionRef::new("shop", "orders");
        store.put(&coll, numbered(7)).await;

        // First page fetched from the start; two of its documents are durable.
        let resume = ResumePoint { token: None, skip: 2 };
        let mut cursor = stream_documents(&store, coll, Some(resume), 3);

        let first = cursor.next_batch().await.unwrap().unwrap();
        assert_eq!(first.skipped, 2);
        assert_eq!(first.origin, None);
        assert_eq!(ids(&first.documents), vec![2]);

        let mut rest = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            assert_eq!(batch.skipped, 0);
            rest.extend(batch.documents);
        }
        assert_eq!(ids(&rest), vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_cursor_on_empty_collection() {
        let store = MemoryStore::new();
        let coll = CollectionRef::new("shop", "carts");
        store.put(&coll, Vec::new()).await;

        let mut cursor = stream_documents(&store, coll, None, 10);
        assert!(cursor.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("mongodb://127.0.0.1:27017", false).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn test_collection_ref_display_and_order() {
        let a = CollectionRef::new("admin", "system.version");
        let b = CollectionRef::new("shop", "carts");
        assert_eq!(a.to_string(), "admin.system.version");
        assert!(a < b);
    }
}
