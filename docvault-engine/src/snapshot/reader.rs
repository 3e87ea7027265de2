//! Snapshot reader.
//!
//! Chunks are read in manifest order, one at a time. A chunk is fully
//! verified (size, checksum, header identity, document count) before any of
//! its documents are handed out, and the first bad chunk ends the stream.

use super::chunk::{decode_chunk, parse_documents};
use super::manifest::{ChunkFile, CollectionEntry, SnapshotManifest};
use crate::document::{Document, Fidelity};
use crate::source::CollectionRef;
use crate::utils::ReadError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SnapshotReader {
    dir: PathBuf,
    manifest: SnapshotManifest,
}

impl SnapshotReader {
    /// Load and verify the manifest in `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, ReadError> {
        let dir = dir.as_ref().to_path_buf();
        let manifest = SnapshotManifest::load(&dir).await?;
        info!(
            dir = %dir.display(),
            collections = manifest.collection_count(),
            documents = manifest.total_documents(),
            created_at = %manifest.created_at,
            "Loaded snapshot manifest"
        );
        Ok(Self { dir, manifest })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    /// Documents of `entry`, chunk by chunk.
    pub fn stream_documents(&self, collection: &CollectionRef, entry: &CollectionEntry) -> ChunkStream {
        ChunkStream {
            dir: self.dir.clone(),
            collection: collection.clone(),
            chunks: entry.chunk_files.clone(),
            fidelity: self.manifest.fidelity,
            next: 0,
            failed: false,
        }
    }
}

/// Lazy sequence of verified chunks for one collection.
#[derive(Debug)]
pub struct ChunkStream {
    dir: PathBuf,
    collection: CollectionRef,
    chunks: Vec<ChunkFile>,
    fidelity: Fidelity,
    next: usize,
    failed: bool,
}

impl ChunkStream {
    /// The next chunk's documents, `None` once all chunks were read or after
    /// an error was returned.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<Document>>, ReadError> {
        if self.failed || self.next >= self.chunks.len() {
            return Ok(None);
        }
        let index = self.next;
        let chunk = self.chunks[index].clone();
        let path = self.dir.join(&chunk.file);
        let collection = self.collection.clone();
        let fidelity = self.fidelity;

        let result = tokio::task::spawn_blocking(move || {
            read_chunk(&path, &chunk, &collection, index, fidelity)
        })
        .await
        .map_err(|e| ReadError::Task(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(documents) => {
                self.next += 1;
                debug!(
                    collection = %self.collection,
                    chunk = index,
                    documents = documents.len(),
                    "Chunk verified"
                );
                Ok(Some(documents))
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }
}

fn read_chunk(
    path: &Path,
    chunk: &ChunkFile,
    collection: &CollectionRef,
    index: usize,
    fidelity: Fidelity,
) -> Result<Vec<Document>, ReadError> {
    let file = chunk.file.as_str();
    let bytes = std::fs::read(path).map_err(|e| ReadError::chunk(file, e.to_string()))?;
    if bytes.len() as u64 != chunk.bytes {
        return Err(ReadError::chunk(
            file,
            format!("file is {} bytes, manifest says {}", bytes.len(), chunk.bytes),
        ));
    }

    let (header, body) = decode_chunk(file, &bytes)?;
    if header.checksum != chunk.checksum {
        return Err(ReadError::chunk(
            file,
            format!("checksum {} does not match manifest {}", header.checksum, chunk.checksum),
        ));
    }
    if header.collection_ref() != *collection || header.index != index {
        return Err(ReadError::chunk(
            file,
            format!(
                "holds chunk {} of {}, expected chunk {} of {}",
                header.index,
                header.collection_ref(),
                index,
                collection
            ),
        ));
    }
    if header.doc_count != chunk.doc_count {
        return Err(ReadError::chunk(
            file,
            format!("header says {} documents, manifest says {}", header.doc_count, chunk.doc_count),
        ));
    }
    parse_documents(file, &header, &body, fidelity)
}

/// Outcome of verifying one collection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedCollection {
    pub collection: CollectionRef,
    pub chunks: usize,
    pub documents: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub dir: PathBuf,
    pub collections: Vec<VerifiedCollection>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.collections.iter().all(|c| c.error.is_none())
    }

    pub fn failed(&self) -> impl Iterator<Item = &VerifiedCollection> {
        self.collections.iter().filter(|c| c.error.is_some())
    }
}

/// Read and verify every chunk of the snapshot in `dir`.
pub async fn verify_snapshot(dir: impl AsRef<Path>) -> Result<VerifyReport, ReadError> {
    let reader = SnapshotReader::open(dir).await?;
    let mut collections = Vec::new();

    for (collection, entry) in reader.manifest().collections() {
        let mut stream = reader.stream_documents(&collection, entry);
        let mut documents = 0u64;
        let mut chunks = 0usize;
        let error = loop {
            match stream.next_chunk().await {
                Ok(Some(docs)) => {
                    documents += docs.len() as u64;
                    chunks += 1;
                }
                Ok(None) => break None,
                Err(e) => {
                    warn!(collection = %collection, error = %e, "Verification failed");
                    break Some(e.to_string());
                }
            }
        };
        collections.push(VerifiedCollection {
            collection,
            chunks,
            documents,
            error,
        });
    }

    Ok(VerifyReport {
        dir: reader.dir().to_path_buf(),
        collections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::writer::{SnapshotWriter, WriterOptions};
    use tempfile::TempDir;

    async fn write_orders(dir: &Path, count: i64) -> Vec<Document> {
        let options = WriterOptions {
            max_chunk_documents: 2,
            ..WriterOptions::default()
        };
        let writer = SnapshotWriter::create(dir, options).await.unwrap();
        let coll = CollectionRef::new("shop", "orders");
        let docs: Vec<Document> = (0..count)
            .map(|i| Document::new().with("_id", i).with("total", i as f64 * 1.5))
            .collect();
        let mut handle = writer.begin_collection(&coll).await.unwrap();
        for doc in &docs {
            handle.append(doc).await.unwrap();
        }
        handle.commit().await.unwrap();
        writer
            .begin_collection(&CollectionRef::new("shop", "carts"))
            .await
            .unwrap()
            .commit()
            .await
            .unwrap();
        writer.finish().await.unwrap();
        docs
    }

    #[tokio::test]
    async fn test_stream_returns_documents_in_chunk_order() {
        let temp = TempDir::new().unwrap();
        let docs = write_orders(temp.path(), 5).await;

        let reader = SnapshotReader::open(temp.path()).await.unwrap();
        let coll = CollectionRef::new("shop", "orders");
        let entry = reader.manifest().entry(&coll).unwrap().clone();
        let mut stream = reader.stream_documents(&coll, &entry);
        assert_eq!(entry.chunk_files.len(), 3);

        let mut seen = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            seen.extend(chunk);
        }
        assert_eq!(seen, docs);
    }

    #[tokio::test]
    async fn test_missing_chunk_fails_only_that_collection() {
        let temp = TempDir::new().unwrap();
        write_orders(temp.path(), 3).await;
        std::fs::remove_file(temp.path().join("shop__orders__1.chunk")).unwrap();

        let report = verify_snapshot(temp.path()).await.unwrap();
        assert!(!report.is_ok());
        let failed: Vec<String> = report.failed().map(|c| c.collection.to_string()).collect();
        assert_eq!(failed, vec!["shop.orders"]);
        let orders = report.failed().next().unwrap();
        assert_eq!(orders.chunks, 1);
    }

    #[tokio::test]
    async fn test_swapped_chunk_is_detected() {
        let temp = TempDir::new().unwrap();
        write_orders(temp.path(), 4).await;
        let a = temp.path().join("shop__orders__0.chunk");
        let b = temp.path().join("shop__orders__1.chunk");
        let tmp = temp.path().join("swap");
        std::fs::rename(&a, &tmp).unwrap();
        std::fs::rename(&b, &a).unwrap();
        std::fs::rename(&tmp, &b).unwrap();

        let report = verify_snapshot(temp.path()).await.unwrap();
        assert!(!report.is_ok());
    }

    #[tokio::test]
    async fn test_open_without_manifest() {
        let temp = TempDir::new().unwrap();
        let err = SnapshotReader::open(temp.path()).await.unwrap_err();
        assert!(matches!(err, ReadError::ManifestMissing(_)));
    }
}
