//! Directory-backed document store.
//!
//! Layout: `<root>/<db>/<collection>.jsonl`, one canonical-JSON document per
//! line, names escaped with [`escape_component`]. Cursor tokens are byte
//! offsets into the collection file. Inserts reject documents whose `_id` is
//! already present.

use super::{CollectionRef, CursorToken, DocumentBatch, DocumentSink, DocumentSource, InsertOutcome};
use crate::document::codec::render_value;
use crate::document::{decode_line, encode_line, Document, Fidelity};
use crate::snapshot::naming::{escape_component, unescape_component};
use crate::utils::{SinkError, SourceError};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

const EXTENSION: &str = "jsonl";

#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsStore {
    /// Open an existing store directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, SourceError> {
        let root = root.as_ref().to_path_buf();
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(Self::at(root)),
            Ok(_) => Err(SourceError::Connection(format!(
                "{} is not a directory",
                root.display()
            ))),
            Err(e) => Err(SourceError::Connection(format!(
                "cannot open store {}: {}",
                root.display(),
                e
            ))),
        }
    }

    /// Open a store directory, creating it if it does not exist.
    pub async fn create(root: impl AsRef<Path>) -> Result<Self, SourceError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            SourceError::Connection(format!("cannot create store {}: {}", root.display(), e))
        })?;
        Ok(Self::at(root))
    }

    fn at(root: PathBuf) -> Self {
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn database_dir(&self, database: &str) -> PathBuf {
        self.root.join(escape_component(database))
    }

    fn collection_path(&self, collection: &CollectionRef) -> PathBuf {
        self.database_dir(collection.database())
            .join(format!("{}.{}", escape_component(collection.collection()), EXTENSION))
    }

    async fn existing_ids(&self, path: &Path) -> std::io::Result<HashSet<String>> {
        let mut ids = HashSet::new();
        let file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e),
        };
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if let Ok(doc) = decode_line(line.as_bytes(), Fidelity::Canonical) {
                if let Some(id) = doc.id() {
                    ids.insert(render_value(id));
                }
            }
        }
        Ok(ids)
    }
}

fn unavailable(collection: &CollectionRef, reason: impl std::fmt::Display) -> SourceError {
    SourceError::Collection {
        collection: collection.clone(),
        reason: reason.to_string(),
    }
}

fn rejected(collection: &CollectionRef, reason: impl std::fmt::Display) -> SinkError {
    SinkError::Collection {
        collection: collection.clone(),
        reason: reason.to_string(),
    }
}

/// Sorted, unescaped names of entries under `dir` accepted by `select`.
async fn list_names(
    dir: &Path,
    select: impl Fn(&str, bool) -> Option<String>,
) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with('.') {
            continue;
        }
        if let Some(raw) = select(&file_name, is_dir) {
            if let Some(name) = unescape_component(&raw) {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

impl DocumentSource for FsStore {
    async fn list_databases(&self) -> Result<Vec<String>, SourceError> {
        list_names(&self.root, |name, is_dir| is_dir.then(|| name.to_string()))
            .await
            .map_err(|e| SourceError::Connection(format!("{}: {}", self.root.display(), e)))
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, SourceError> {
        let dir = self.database_dir(database);
        let suffix = format!(".{EXTENSION}");
        list_names(&dir, |name, is_dir| {
            (!is_dir).then(|| name.strip_suffix(&suffix).map(str::to_string)).flatten()
        })
        .await
        .map_err(|e| SourceError::Database {
            database: database.to_string(),
            reason: e.to_string(),
        })
    }

    async fn fetch_batch(
        &self,
        collection: &CollectionRef,
        cursor: Option<&CursorToken>,
        limit: usize,
    ) -> Result<DocumentBatch, SourceError> {
        let offset: u64 = match cursor {
            None => 0,
            Some(token) => token
                .as_str()
                .parse()
                .map_err(|_| SourceError::InvalidCursor(token.as_str().to_string()))?,
        };

        let path = self.collection_path(collection);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| unavailable(collection, e))?;
        let len = file.metadata().await.map_err(|e| unavailable(collection, e))?.len();
        if offset > len {
            return Err(SourceError::InvalidCursor(offset.to_string()));
        }
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| unavailable(collection, e))?;

        let mut reader = BufReader::new(file);
        let mut position = offset;
        let mut documents = Vec::with_capacity(limit.min(1024));
        let mut line = Vec::new();
        while documents.len() < limit {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| unavailable(collection, e))?;
            if read == 0 {
                break;
            }
            position += read as u64;
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            let doc = decode_line(trimmed, Fidelity::Canonical)
                .map_err(|e| unavailable(collection, format!("at byte {}: {}", position, e)))?;
            documents.push(doc);
        }

        let next = (position < len).then(|| CursorToken::new(position.to_string()));
        debug!(collection = %collection, offset, fetched = documents.len(), "Fetched batch");
        Ok(DocumentBatch { documents, next })
    }
}

impl DocumentSink for FsStore {
    async fn ensure_collection(&self, collection: &CollectionRef) -> Result<(), SinkError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.database_dir(collection.database());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SinkError::Connection(format!("{}: {}", dir.display(), e)))?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.collection_path(collection))
            .await
            .map_err(|e| rejected(collection, e))?;
        Ok(())
    }

    async fn insert_batch(
        &self,
        collection: &CollectionRef,
        documents: Vec<Document>,
        ordered: bool,
    ) -> Result<InsertOutcome, SinkError> {
        let _guard = self.write_lock.lock().await;
        let path = self.collection_path(collection);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::Connection(format!("{}: {}", parent.display(), e)))?;
        }

        let mut ids = self
            .existing_ids(&path)
            .await
            .map_err(|e| rejected(collection, e))?;
        let mut outcome = InsertOutcome::default();
        let mut buffer = Vec::new();

        for (offset, doc) in documents.iter().enumerate() {
            if let Some(id) = doc.id().map(render_value) {
                if !ids.insert(id.clone()) {
                    outcome.failures.push((offset, format!("duplicate key: _id {id}")));
                    if ordered {
                        break;
                    }
                    continue;
                }
            }
            match encode_line(doc, Fidelity::Canonical) {
                Ok(line) => {
                    buffer.extend_from_slice(&line);
                    buffer.push(b'\n');
                    outcome.inserted += 1;
                }
                Err(e) => {
                    outcome.failures.push((offset, e.to_string()));
                    if ordered {
                        break;
                    }
                }
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| rejected(collection, e))?;
        file.write_all(&buffer).await.map_err(|e| rejected(collection, e))?;
        file.sync_data().await.map_err(|e| rejected(collection, e))?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::stream_documents;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_missing_root_is_connection_error() {
        let temp = TempDir::new().unwrap();
        let err = FsStore::open(temp.path().join("nope")).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_insert_then_read_back() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::create(temp.path()).await.unwrap();
        let coll = CollectionRef::new("shop", "order_items");

        let docs: Vec<Document> = (0..5)
            .map(|i| Document::new().with("_id", i).with("qty", i * 2))
            .collect();
        let outcome = store.insert_batch(&coll, docs.clone(), true).await.unwrap();
        assert_eq!(outcome.inserted, 5);

        assert_eq!(store.list_databases().await.unwrap(), vec!["shop"]);
        assert_eq!(store.list_collections("shop").await.unwrap(), vec!["order_items"]);

        let mut cursor = stream_documents(&store, coll, None, 2);
        let mut seen = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            seen.extend(batch.documents);
        }
        assert_eq!(seen, docs);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_across_batches() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::create(temp.path()).await.unwrap();
        let coll = CollectionRef::new("db", "c");

        store
            .insert_batch(&coll, vec![Document::new().with("_id", "a")], true)
            .await
            .unwrap();
        let outcome = store
            .insert_batch(
                &coll,
                vec![Document::new().with("_id", "a"), Document::new().with("_id", "b")],
                false,
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.failures, vec![(0, "duplicate key: _id \"a\"".to_string())]);
    }

    #[tokio::test]
    async fn test_ensure_collection_creates_empty_file() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::create(temp.path()).await.unwrap();
        let coll = CollectionRef::new("shop", "carts");

        store.ensure_collection(&coll).await.unwrap();
        assert_eq!(store.list_collections("shop").await.unwrap(), vec!["carts"]);
        let batch = store.fetch_batch(&coll, None, 10).await.unwrap();
        assert!(batch.documents.is_empty());
        assert!(batch.next.is_none());
    }
}
