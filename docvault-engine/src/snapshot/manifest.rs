//! Snapshot manifest.
//!
//! `manifest.json` is the single source of truth for a snapshot: which
//! collections were captured, which chunk files hold them and in what order,
//! and how many documents each holds. It is written exactly once, atomically,
//! after every referenced chunk is durable. The file carries a checksum over
//! its own content (every field except `checksum`).

use super::checksum::{checksum_of, verify_checksum};
use super::chunk::Compression;
use super::naming::{is_safe_file_name, MANIFEST_FILE};
use super::write_atomic;
use crate::document::Fidelity;
use crate::source::CollectionRef;
use crate::utils::{ReadError, WriteError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub fidelity: Fidelity,
    pub compression: Compression,
    pub databases: Vec<DatabaseEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEntry {
    pub name: String,
    pub collections: Vec<CollectionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionEntry {
    pub name: String,
    pub chunk_files: Vec<ChunkFile>,
    pub doc_count: u64,
    /// Monotonic capture time: strictly increasing across collections of a run.
    pub timestamp_captured_at: DateTime<Utc>,
}

impl CollectionEntry {
    pub fn total_bytes(&self) -> u64 {
        self.chunk_files.iter().map(|c| c.bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFile {
    pub file: String,
    pub doc_count: u64,
    /// Size of the chunk file on disk.
    pub bytes: u64,
    pub checksum: String,
}

impl SnapshotManifest {
    pub fn new(fidelity: Fidelity, compression: Compression, created_at: DateTime<Utc>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at,
            fidelity,
            compression,
            databases: Vec::new(),
        }
    }

    /// Add a collection entry, keeping databases and collections sorted by name.
    pub fn insert(
        &mut self,
        collection: &CollectionRef,
        mut entry: CollectionEntry,
    ) -> Result<(), WriteError> {
        entry.name = collection.collection().to_string();

        let db_pos = match self
            .databases
            .binary_search_by(|db| db.name.as_str().cmp(collection.database()))
        {
            Ok(pos) => pos,
            Err(pos) => {
                self.databases.insert(
                    pos,
                    DatabaseEntry {
                        name: collection.database().to_string(),
                        collections: Vec::new(),
                    },
                );
                pos
            }
        };

        let collections = &mut self.databases[db_pos].collections;
        match collections.binary_search_by(|c| c.name.as_str().cmp(collection.collection())) {
            Ok(_) => Err(WriteError::AlreadyCommitted(collection.clone())),
            Err(pos) => {
                collections.insert(pos, entry);
                Ok(())
            }
        }
    }

    /// Every collection in manifest order.
    pub fn collections(&self) -> impl Iterator<Item = (CollectionRef, &CollectionEntry)> + '_ {
        self.databases.iter().flat_map(|db| {
            db.collections
                .iter()
                .map(move |c| (CollectionRef::new(db.name.clone(), c.name.clone()), c))
        })
    }

    pub fn entry(&self, collection: &CollectionRef) -> Option<&CollectionEntry> {
        self.databases
            .iter()
            .find(|db| db.name == collection.database())?
            .collections
            .iter()
            .find(|c| c.name == collection.collection())
    }

    pub fn collection_count(&self) -> usize {
        self.databases.iter().map(|db| db.collections.len()).sum()
    }

    pub fn total_documents(&self) -> u64 {
        self.collections().map(|(_, c)| c.doc_count).sum()
    }

    /// Structural checks: unique names, safe and unique file names, and chunk
    /// document counts that add up to each collection's count.
    pub fn validate(&self) -> Result<(), String> {
        if self.format_version != FORMAT_VERSION {
            return Err(format!("unsupported formatVersion {}", self.format_version));
        }

        let mut databases = HashSet::new();
        let mut files = HashSet::new();
        for db in &self.databases {
            if db.name.is_empty() {
                return Err("empty database name".to_string());
            }
            if !databases.insert(db.name.as_str()) {
                return Err(format!("database {} listed twice", db.name));
            }

            let mut collections = HashSet::new();
            for coll in &db.collections {
                let label = format!("{}.{}", db.name, coll.name);
                if coll.name.is_empty() {
                    return Err(format!("empty collection name in database {}", db.name));
                }
                if !collections.insert(coll.name.as_str()) {
                    return Err(format!("collection {label} listed twice"));
                }

                let mut sum = 0u64;
                for chunk in &coll.chunk_files {
                    if !is_safe_file_name(&chunk.file) {
                        return Err(format!("{label}: unsafe chunk file name {:?}", chunk.file));
                    }
                    if !files.insert(chunk.file.as_str()) {
                        return Err(format!("chunk file {} referenced twice", chunk.file));
                    }
                    if super::checksum::parse_checksum(&chunk.checksum).is_none() {
                        return Err(format!("{label}: malformed checksum for {}", chunk.file));
                    }
                    sum += chunk.doc_count;
                }
                if sum != coll.doc_count {
                    return Err(format!(
                        "{label}: chunks hold {sum} documents, docCount says {}",
                        coll.doc_count
                    ));
                }
            }
        }
        Ok(())
    }

    /// Serialize with an embedded checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| WriteError::Encode(e.to_string()))?;
        let body = serde_json::to_vec(&value).map_err(|e| WriteError::Encode(e.to_string()))?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("checksum".to_string(), checksum_of(&body).into());
        }
        let mut bytes =
            serde_json::to_vec_pretty(&value).map_err(|e| WriteError::Encode(e.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse, verify the checksum, and validate structure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReadError> {
        let corrupt = |reason: String| ReadError::CorruptManifest(reason);

        let mut value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| corrupt(format!("invalid JSON: {e}")))?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| corrupt("manifest is not a JSON object".to_string()))?;
        let checksum = match map.remove("checksum") {
            Some(serde_json::Value::String(s)) => s,
            Some(_) => return Err(corrupt("checksum must be a string".to_string())),
            None => return Err(corrupt("checksum missing".to_string())),
        };

        let body = serde_json::to_vec(&value).map_err(|e| corrupt(e.to_string()))?;
        verify_checksum(&body, &checksum).map_err(corrupt)?;

        let manifest: SnapshotManifest =
            serde_json::from_value(value).map_err(|e| corrupt(format!("invalid structure: {e}")))?;
        manifest.validate().map_err(corrupt)?;
        Ok(manifest)
    }

    /// Atomically write `manifest.json` into `dir`.
    pub async fn write(&self, dir: &Path) -> Result<(), WriteError> {
        self.validate().map_err(WriteError::Encode)?;
        let bytes = self.to_bytes()?;
        write_atomic(dir.join(MANIFEST_FILE), bytes).await
    }

    /// Load and verify `manifest.json` from `dir`.
    pub async fn load(dir: &Path) -> Result<Self, ReadError> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReadError::ManifestMissing(dir.to_path_buf()))
            }
            Err(e) => return Err(ReadError::Io { path, source: e }),
        };
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 123_456_000).unwrap()
    }

    fn chunk(file: &str, docs: u64) -> ChunkFile {
        ChunkFile {
            file: file.to_string(),
            doc_count: docs,
            bytes: 100 + docs,
            checksum: "crc32:0badf00d".to_string(),
        }
    }

    fn sample() -> SnapshotManifest {
        let mut m = SnapshotManifest::new(Fidelity::Canonical, Compression::Zstd, at(10));
        m.insert(
            &CollectionRef::new("shop", "orders"),
            CollectionEntry {
                name: String::new(),
                chunk_files: vec![chunk("shop__orders__0.chunk", 3)],
                doc_count: 3,
                timestamp_captured_at: at(1),
            },
        )
        .unwrap();
        m.insert(
            &CollectionRef::new("shop", "carts"),
            CollectionEntry {
                name: String::new(),
                chunk_files: vec![],
                doc_count: 0,
                timestamp_captured_at: at(2),
            },
        )
        .unwrap();
        m
    }

    #[test]
    fn test_insert_keeps_sorted_and_rejects_duplicates() {
        let mut m = sample();
        let names: Vec<String> = m.collections().map(|(c, _)| c.to_string()).collect();
        assert_eq!(names, vec!["shop.carts", "shop.orders"]);

        let dup = m.entry(&CollectionRef::new("shop", "orders")).unwrap().clone();
        let err = m.insert(&CollectionRef::new("shop", "orders"), dup).unwrap_err();
        assert!(matches!(err, WriteError::AlreadyCommitted(_)));
        assert_eq!(m.collection_count(), 2);
        assert_eq!(m.total_documents(), 3);
    }

    #[tokio::test]
    async fn test_write_then_load_is_identity() {
        let temp = TempDir::new().unwrap();
        let manifest = sample();

        manifest.write(temp.path()).await.unwrap();
        let loaded = SnapshotManifest::load(temp.path()).await.unwrap();

        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn test_load_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let err = SnapshotManifest::load(&temp.path().join("absent")).await.unwrap_err();
        assert!(matches!(err, ReadError::ManifestMissing(_)));
    }

    #[test]
    fn test_tampered_manifest_is_corrupt() {
        let bytes = sample().to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap().replace("\"docCount\": 3", "\"docCount\": 4");
        let err = SnapshotManifest::from_bytes(text.as_bytes()).unwrap_err();
        assert!(matches!(err, ReadError::CorruptManifest(ref msg) if msg.contains("checksum")));

        let err = SnapshotManifest::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, ReadError::CorruptManifest(_)));
    }

    #[test]
    fn test_validate_rejects_bad_structure() {
        let mut m = sample();
        m.databases[0].collections[1].doc_count = 7;
        assert!(m.validate().unwrap_err().contains("docCount"));

        let mut m = sample();
        m.databases[0].collections[1].chunk_files[0].file = "../escape.chunk".to_string();
        assert!(m.validate().unwrap_err().contains("unsafe"));

        let mut m = sample();
        let copy = m.databases[0].clone();
        m.databases.push(copy);
        assert!(m.validate().unwrap_err().contains("listed twice"));
    }
}
