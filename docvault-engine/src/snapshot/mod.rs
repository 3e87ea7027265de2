//! On-disk snapshot format: chunk files plus a manifest.
//!
//! Every file is published with write-to-temp, fsync, rename, fsync-directory,
//! so readers only ever see complete files.

pub mod checksum;
pub mod chunk;
pub mod manifest;
pub mod naming;
pub mod reader;
pub mod writer;

use crate::utils::WriteError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub use chunk::Compression;
pub use manifest::{ChunkFile, CollectionEntry, DatabaseEntry, SnapshotManifest};
pub use reader::{verify_snapshot, ChunkStream, SnapshotReader, VerifyReport};
pub use writer::{CaptureClock, OpenedCollection, SnapshotWriter, WriteHandle, WriterOptions};

/// Flush directory metadata so a preceding rename survives a crash.
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Blocking atomic write of `bytes` to `path`.
pub(crate) fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let tmp = tmp_path(path);
    let mut file = File::create(&tmp).map_err(|e| WriteError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| WriteError::io(&tmp, e))?;
    file.sync_all().map_err(|e| WriteError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| WriteError::io(path, e))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).map_err(|e| WriteError::io(parent, e))?;
    }
    Ok(())
}

/// Atomic write on the blocking pool.
pub async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<(), WriteError> {
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes))
        .await
        .map_err(|e| WriteError::Task(e.to_string()))?
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_replaces_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");

        write_atomic(path.clone(), b"first".to_vec()).await.unwrap();
        write_atomic(path.clone(), b"second".to_vec()).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!tmp_path(&path).exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
