//! Configuration management for docvault.
//!
//! Loads configuration from a TOML file; every field has a default, so an
//! empty file (or no file at all) is a valid configuration. Command-line
//! flags override individual fields after loading.

use crate::backup::BackupOptions;
use crate::document::Fidelity;
use crate::policy::{ExclusionPolicy, DEFAULT_EXCLUDES};
use crate::restore::{ErrorMode, RestoreOptions};
use crate::snapshot::{Compression, WriterOptions};
use crate::utils::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub snapshot: SnapshotConfig,
    pub performance: PerformanceConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Maximum documents per chunk
    #[serde(default = "default_max_chunk_documents")]
    pub max_chunk_documents: usize,

    /// Maximum encoded bytes per chunk (before compression)
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,

    /// Chunk body compression (zstd, none)
    #[serde(default)]
    pub compression: Compression,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Typed value encoding (canonical, relaxed)
    #[serde(default)]
    pub fidelity: Fidelity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Collections processed at the same time
    #[serde(default = "default_max_concurrent_collections")]
    pub max_concurrent_collections: usize,

    /// Documents requested from the source per round trip
    #[serde(default = "default_batch_size")]
    pub fetch_batch_size: usize,

    /// Documents sent to the target per insert call
    #[serde(default = "default_batch_size")]
    pub insert_batch_size: usize,

    /// Interval between progress log lines, in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// `database.collection` patterns never written to a snapshot
    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// `database.collection` patterns skipped on restore
    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: Vec<String>,

    /// What a rejected document does to its collection (continue, stop)
    #[serde(default)]
    pub error_mode: ErrorMode,

    /// Largest tolerated fraction of rejected documents in continue mode
    #[serde(default)]
    pub max_failure_ratio: f64,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_chunk_documents() -> usize {
    10_000
}

fn default_max_chunk_bytes() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_concurrent_collections() -> usize {
    4
}

fn default_batch_size() -> usize {
    1000
}

fn default_progress_interval_ms() -> u64 {
    2000
}

fn default_exclude_namespaces() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_chunk_documents: default_max_chunk_documents(),
            max_chunk_bytes: default_max_chunk_bytes(),
            compression: Compression::default(),
            compression_level: default_compression_level(),
            fidelity: Fidelity::default(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_collections: default_max_concurrent_collections(),
            fetch_batch_size: default_batch_size(),
            insert_batch_size: default_batch_size(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            exclude_namespaces: default_exclude_namespaces(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            exclude_namespaces: default_exclude_namespaces(),
            error_mode: ErrorMode::default(),
            max_failure_ratio: 0.0,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.snapshot.max_chunk_documents == 0 {
            return invalid("snapshot.max_chunk_documents must be at least 1");
        }
        if self.snapshot.max_chunk_bytes == 0 {
            return invalid("snapshot.max_chunk_bytes must be at least 1");
        }
        if !(1..=22).contains(&self.snapshot.compression_level) {
            return invalid("snapshot.compression_level must be between 1 and 22");
        }
        if self.performance.max_concurrent_collections == 0 {
            return invalid("performance.max_concurrent_collections must be at least 1");
        }
        if self.performance.fetch_batch_size == 0 || self.performance.insert_batch_size == 0 {
            return invalid("performance batch sizes must be at least 1");
        }
        if self.performance.progress_interval_ms == 0 {
            return invalid("performance.progress_interval_ms must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.restore.max_failure_ratio) {
            return invalid("restore.max_failure_ratio must be between 0 and 1");
        }
        ExclusionPolicy::from_patterns(&self.backup.exclude_namespaces)?;
        ExclusionPolicy::from_patterns(&self.restore.exclude_namespaces)?;
        Ok(())
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            max_chunk_documents: self.snapshot.max_chunk_documents,
            max_chunk_bytes: self.snapshot.max_chunk_bytes,
            compression: self.snapshot.compression,
            compression_level: self.snapshot.compression_level,
            fidelity: self.snapshot.fidelity,
        }
    }

    fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.performance.progress_interval_ms)
    }

    pub fn backup_options(&self) -> Result<BackupOptions, ConfigError> {
        Ok(BackupOptions {
            max_concurrent_collections: self.performance.max_concurrent_collections,
            fetch_batch_size: self.performance.fetch_batch_size,
            exclusion: ExclusionPolicy::from_patterns(&self.backup.exclude_namespaces)?,
            resume: false,
            writer: self.writer_options(),
            progress_interval: self.progress_interval(),
        })
    }

    pub fn restore_options(&self) -> Result<RestoreOptions, ConfigError> {
        Ok(RestoreOptions {
            error_mode: self.restore.error_mode,
            max_failure_ratio: self.restore.max_failure_ratio,
            insert_batch_size: self.performance.insert_batch_size,
            max_concurrent_collections: self.performance.max_concurrent_collections,
            exclusion: ExclusionPolicy::from_patterns(&self.restore.exclude_namespaces)?,
            progress_interval: self.progress_interval(),
        })
    }
}
