//! Utility modules for the engine.

pub mod errors;
pub mod logger;

pub use errors::{
    ConfigError, DecodeError, InsertError, ReadError, Result, SinkError, SourceError, VaultError,
    WriteError,
};
