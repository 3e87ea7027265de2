//! In-process document store.
//!
//! Serves as both source and restore target. Inserts reject a second document
//! with an `_id` already present in the collection, mirroring the unique-id
//! constraint restore idempotence relies on. `set_offline` and
//! `fail_collection` simulate an unreachable server and a broken collection.

use super::{CollectionRef, CursorToken, DocumentBatch, DocumentSink, DocumentSource, InsertOutcome};
use crate::document::codec::render_value;
use crate::document::Document;
use crate::utils::{SinkError, SourceError};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

type Collections = BTreeMap<String, Vec<Document>>;

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    databases: Arc<RwLock<BTreeMap<String, Collections>>>,
    broken: Arc<RwLock<HashSet<CollectionRef>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of a collection, creating it if needed.
    pub async fn put(&self, collection: &CollectionRef, documents: Vec<Document>) {
        let mut dbs = self.databases.write().await;
        dbs.entry(collection.database().to_string())
            .or_default()
            .insert(collection.collection().to_string(), documents);
    }

    /// Snapshot of a collection's documents, `None` if it does not exist.
    pub async fn documents(&self, collection: &CollectionRef) -> Option<Vec<Document>> {
        let dbs = self.databases.read().await;
        dbs.get(collection.database())
            .and_then(|colls| colls.get(collection.collection()))
            .cloned()
    }

    pub async fn collection_refs(&self) -> Vec<CollectionRef> {
        let dbs = self.databases.read().await;
        dbs.iter()
            .flat_map(|(db, colls)| colls.keys().map(move |c| CollectionRef::new(db.clone(), c.clone())))
            .collect()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every read of `collection` fail with a collection-level error.
    pub async fn fail_collection(&self, collection: &CollectionRef) {
        self.broken.write().await.insert(collection.clone());
    }

    fn check_online(&self) -> Result<(), SourceError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SourceError::Connection("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn parse_offset(cursor: Option<&CursorToken>) -> Result<usize, SourceError> {
    match cursor {
        None => Ok(0),
        Some(token) => token
            .as_str()
            .parse()
            .map_err(|_| SourceError::InvalidCursor(token.as_str().to_string())),
    }
}

impl DocumentSource for MemoryStore {
    async fn list_databases(&self) -> Result<Vec<String>, SourceError> {
        self.check_online()?;
        Ok(self.databases.read().await.keys().cloned().collect())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, SourceError> {
        self.check_online()?;
        let dbs = self.databases.read().await;
        Ok(dbs
            .get(database)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_batch(
        &self,
        collection: &CollectionRef,
        cursor: Option<&CursorToken>,
        limit: usize,
    ) -> Result<DocumentBatch, SourceError> {
        self.check_online()?;
        if self.broken.read().await.contains(collection) {
            return Err(SourceError::Collection {
                collection: collection.clone(),
                reason: "collection is unreadable".to_string(),
            });
        }

        let offset = parse_offset(cursor)?;
        let dbs = self.databases.read().await;
        let docs = dbs
            .get(collection.database())
            .and_then(|colls| colls.get(collection.collection()))
            .ok_or_else(|| SourceError::Collection {
                collection: collection.clone(),
                reason: "collection not found".to_string(),
            })?;

        let end = offset.saturating_add(limit).min(docs.len());
        let documents = docs.get(offset..end).map(<[Document]>::to_vec).unwrap_or_default();
        let next = (end < docs.len()).then(|| CursorToken::new(end.to_string()));

        Ok(DocumentBatch { documents, next })
    }
}

impl DocumentSink for MemoryStore {
    async fn ensure_collection(&self, collection: &CollectionRef) -> Result<(), SinkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SinkError::Connection("memory store is offline".to_string()));
        }
        let mut dbs = self.databases.write().await;
        dbs.entry(collection.database().to_string())
            .or_default()
            .entry(collection.collection().to_string())
            .or_default();
        Ok(())
    }

    async fn insert_batch(
        &self,
        collection: &CollectionRef,
        documents: Vec<Document>,
        ordered: bool,
    ) -> Result<InsertOutcome, SinkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SinkError::Connection("memory store is offline".to_string()));
        }
        if self.broken.read().await.contains(collection) {
            return Err(SinkError::Collection {
                collection: collection.clone(),
                reason: "collection is read-only".to_string(),
            });
        }

        let mut dbs = self.databases.write().await;
        let target = dbs
            .entry(collection.database().to_string())
            .or_default()
            .entry(collection.collection().to_string())
            .or_default();

        let mut outcome = InsertOutcome::default();
        for (offset, doc) in documents.into_iter().enumerate() {
            let duplicate = doc
                .id()
                .is_some_and(|id| target.iter().any(|existing| existing.id() == Some(id)));
            if duplicate {
                let id = doc.id().map(render_value).unwrap_or_default();
                outcome
                    .failures
                    .push((offset, format!("duplicate key: _id {id}")));
                if ordered {
                    break;
                }
                continue;
            }
            target.push(doc);
            outcome.inserted += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paging_tokens() {
        let store = MemoryStore::new();
        let coll = CollectionRef::new("db", "c");
        store
            .put(&coll, (0..5).map(|i| Document::new().with("_id", i)).collect())
            .await;

        let first = store.fetch_batch(&coll, None, 2).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        assert_eq!(first.next, Some(CursorToken::new("2")));

        let last = store
            .fetch_batch(&coll, Some(&CursorToken::new("4")), 2)
            .await
            .unwrap();
        assert_eq!(last.documents.len(), 1);
        assert!(last.next.is_none());

        let err = store
            .fetch_batch(&coll, Some(&CursorToken::new("bogus")), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected() {
        let store = MemoryStore::new();
        let coll = CollectionRef::new("db", "c");
        let docs = vec![
            Document::new().with("_id", 1),
            Document::new().with("_id", 1),
            Document::new().with("_id", 2),
        ];

        let outcome = store.insert_batch(&coll, docs.clone(), false).await.unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, 1);

        let ordered = store.insert_batch(&coll, docs, true).await.unwrap();
        assert_eq!(ordered.inserted, 0);
        assert_eq!(ordered.failures.len(), 1);
        assert_eq!(store.documents(&coll).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_store_reports_connection_error() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(store.list_databases().await.unwrap_err().is_connection());
        let coll = CollectionRef::new("db", "c");
        assert!(store.ensure_collection(&coll).await.unwrap_err().is_connection());
    }
}
