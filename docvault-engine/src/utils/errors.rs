//! Error taxonomy for the backup/restore engine.
//!
//! Errors are layered by blast radius:
//! - [`SourceError::Connection`] / [`SinkError::Connection`] abort the whole run
//! - [`ReadError::CorruptManifest`] aborts a restore before any write happens
//! - [`ReadError::ChunkCorrupt`] and [`WriteError`] fail a single collection
//! - [`InsertError`] fails a single document and is accumulated in the report

use crate::source::CollectionRef;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading from a document source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Collection {collection} unavailable: {reason}")]
    Collection {
        collection: CollectionRef,
        reason: String,
    },

    #[error("Database {database} unavailable: {reason}")]
    Database { database: String, reason: String },

    #[error("Invalid cursor token: {0}")]
    InvalidCursor(String),
}

impl SourceError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SourceError::Connection(_))
    }
}

/// Errors raised by a restore target for a whole call (not per document).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Collection {collection} rejected writes: {reason}")]
    Collection {
        collection: CollectionRef,
        reason: String,
    },
}

impl SinkError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SinkError::Connection(_))
    }
}

/// A single document the target refused to insert.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("document #{index}{}: {reason}", id_suffix(.document_id))]
pub struct InsertError {
    /// Position of the document within its collection, in snapshot order.
    pub index: u64,
    pub document_id: Option<String>,
    pub reason: String,
}

fn id_suffix(id: &Option<String>) -> String {
    id.as_deref()
        .map(|id| format!(" (_id {id})"))
        .unwrap_or_default()
}

/// Malformed document JSON.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid document: {0}")]
pub struct DecodeError(pub String);

/// Errors raised while persisting snapshot artifacts.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Snapshot already exists at {}", .0.display())]
    SnapshotExists(PathBuf),

    #[error("Unfinished backup found at {}; resume it or remove the directory", .0.display())]
    StagingExists(PathBuf),

    #[error("Cannot resume: {0}")]
    ResumeMismatch(String),

    #[error("Collection {0} already committed")]
    AlreadyCommitted(CollectionRef),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl WriteError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WriteError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while loading or streaming a snapshot.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("No snapshot manifest found at {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("Corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("Corrupt chunk {file}: {reason}")]
    ChunkCorrupt { file: String, reason: String },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ReadError {
    pub fn chunk(file: impl Into<String>, reason: impl Into<String>) -> Self {
        ReadError::ChunkCorrupt {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Run-level error returned by the orchestrator, restore engine and CLI.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("No snapshot manifest found at {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Read(ReadError),

    #[error(transparent)]
    Source(SourceError),

    #[error(transparent)]
    Sink(SinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Process exit code for this error: 2 for connection failures, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            VaultError::Connection(_) => 2,
            _ => 1,
        }
    }
}

impl From<SourceError> for VaultError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Connection(msg) => VaultError::Connection(msg),
            other => VaultError::Source(other),
        }
    }
}

impl From<SinkError> for VaultError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Connection(msg) => VaultError::Connection(msg),
            other => VaultError::Sink(other),
        }
    }
}

impl From<ReadError> for VaultError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::ManifestMissing(path) => VaultError::ManifestMissing(path),
            ReadError::CorruptManifest(msg) => VaultError::CorruptManifest(msg),
            other => VaultError::Read(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(VaultError::Connection("down".into()).exit_code(), 2);
        assert_eq!(VaultError::CorruptManifest("bad".into()).exit_code(), 1);
        assert_eq!(
            VaultError::from(SourceError::Connection("refused".into())).exit_code(),
            2
        );
    }

    #[test]
    fn test_collection_errors_do_not_look_like_connection_loss() {
        let err = VaultError::from(SourceError::Database {
            database: "billing".into(),
            reason: "permission denied".into(),
        });
        assert!(matches!(err, VaultError::Source(_)));
        assert_eq!(err.exit_code(), 1);

        let err = VaultError::from(SinkError::Connection("reset".into()));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_read_error_conversion_keeps_fatal_kinds() {
        let err = VaultError::from(ReadError::CorruptManifest("checksum".into()));
        assert!(matches!(err, VaultError::CorruptManifest(_)));

        let err = VaultError::from(ReadError::chunk("a__b__0.chunk", "missing"));
        assert!(matches!(err, VaultError::Read(ReadError::ChunkCorrupt { .. })));
    }

    #[test]
    fn test_insert_error_display() {
        let err = InsertError {
            index: 4,
            document_id: Some("\"abc\"".into()),
            reason: "duplicate key".into(),
        };
        assert_eq!(err.to_string(), "document #4 (_id \"abc\"): duplicate key");

        let err = InsertError {
            index: 0,
            document_id: None,
            reason: "rejected".into(),
        };
        assert_eq!(err.to_string(), "document #0: rejected");
    }
}
