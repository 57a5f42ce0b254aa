//! In-memory storage backend
//!
//! Sparse byte map with zero-filled reads. Everything is "durable" the
//! moment it is written, so flush is a no-op. Used by tests and as a
//! reference backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StorageBackend, StorageResult};

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    data: RwLock<HashMap<u64, u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn read(&self, offset: u64, length: u32) -> StorageResult<Vec<u8>> {
        let data = self.data.read().await;
        Ok((0..u64::from(length))
            .map(|i| data.get(&(offset + i)).copied().unwrap_or(0))
            .collect())
    }

    async fn write(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write().await;
        for (i, byte) in bytes.iter().enumerate() {
            data.insert(offset + i as u64, *byte);
        }
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_your_writes() {
        let storage = InMemoryStorage::new();
        storage.write(100, b"hello").await.unwrap();
        assert_eq!(storage.read(100, 5).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_unwritten_reads_zero() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.read(0, 4).await.unwrap(), vec![0u8; 4]);

        storage.write(2, b"ab").await.unwrap();
        assert_eq!(storage.read(0, 6).await.unwrap(), vec![0, 0, b'a', b'b', 0, 0]);
    }

    #[tokio::test]
    async fn test_zero_length_read() {
        let storage = InMemoryStorage::new();
        assert!(storage.read(1234, 0).await.unwrap().is_empty());
    }
}
