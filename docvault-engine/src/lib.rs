//! Docvault Engine Library
//!
//! Consistent, resumable backup and restore for document stores: chunked,
//! checksummed snapshots with an atomically published manifest, per-collection
//! fault isolation, and resume from the last durable chunk.

pub mod backup;
pub mod config;
pub mod document;
pub mod events;
pub mod policy;
pub mod progress;
pub mod restore;
pub mod snapshot;
pub mod source;
pub mod utils;

// Re-export commonly used types
pub use backup::{BackupOptions, BackupOrchestrator, BackupReport, CollectionOutcome, CollectionStatus};
pub use config::Config;
pub use document::{Document, Fidelity, ObjectId, Value};
pub use events::{EventBus, VaultEvent};
pub use policy::{ExclusionPolicy, NamespacePattern};
pub use restore::{
    CollectionState, ErrorMode, RestoreEngine, RestoreOptions, RestoreOutcome, RestorePlan,
    RestoreReport,
};
pub use snapshot::{
    verify_snapshot, Compression, SnapshotManifest, SnapshotReader, SnapshotWriter, VerifyReport,
};
pub use source::{connect, AnyStore, CollectionRef, DocumentSink, DocumentSource, FsStore, MemoryStore};
pub use utils::errors::VaultError;
pub type Result<T> = std::result::Result<T, VaultError>;
