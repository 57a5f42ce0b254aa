//! NBD server backed by S3-compatible object storage
//!
//! This crate exposes named exports over the NBD fixed-newstyle protocol.
//! Block content lives in an object store as fixed-size objects; a
//! per-export lease lock, built on S3 conditional writes, keeps concurrent
//! connections from sharing an export.

pub mod config;
pub mod nbd;
pub mod storage;

pub use config::{ConfigError, S3Config, ServerConfig};
pub use nbd::NbdServer;
pub use storage::{InMemoryStorage, S3Storage, StorageBackend, StorageError};
