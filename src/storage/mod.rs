//! Storage backends
//!
//! Defines the StorageBackend trait, the S3-backed block store, its lease
//! lock, and the shared object-store client.

pub mod client;
pub mod lock;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("export '{0}' is locked by another connection")]
    ExportBusy(String),

    #[error("lease for export '{0}' is no longer held")]
    LeaseLost(String),

    #[error("flush failed: {failed} of {total} blocks were not uploaded")]
    FlushFailed { failed: usize, total: usize },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Byte-addressed storage behind one NBD connection.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`.
    /// Unwritten regions read as zeros.
    async fn read(&self, offset: u64, length: u32) -> StorageResult<Vec<u8>>;

    /// Write `data` at `offset`. Not durable until `flush`.
    async fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Persist all buffered writes.
    async fn flush(&self) -> StorageResult<()>;

    /// Give up the backing resources without flushing.
    async fn release(&self);
}

/// Map an SDK error to a storage error, keeping the service-level context.
pub(crate) fn object_store_error<E, R>(err: aws_sdk_s3::error::SdkError<E, R>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    StorageError::ObjectStore(format!("{}", aws_sdk_s3::error::DisplayErrorContext(err)))
}

// Re-export backends
pub use client::ClientManager;
pub use lock::{LeaseLock, LeaseState, DEFAULT_LEASE_DURATION};
pub use memory::InMemoryStorage;
pub use s3::{S3Storage, DEFAULT_BLOCK_SIZE};
