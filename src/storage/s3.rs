//! S3-backed block storage
//!
//! Translates arbitrary byte ranges into fixed-size blocks stored as objects
//! at `blocks/{export_name}/{block_number:08x}`. Writes land in a
//! per-connection write-back buffer and become durable on flush; absent
//! objects read as zeros.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use futures::future::join_all;
use tokio::sync::RwLock;

use super::client::ClientManager;
use super::lock::{LeaseLock, LeaseState};
use super::{object_store_error, StorageBackend, StorageError, StorageResult};

/// Default block size (128 KiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;

/// One block-aligned slice of a byte-range operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockSpan {
    block_offset: u64,
    offset_in_block: usize,
    chunk: usize,
}

/// Split `(offset, length)` into the sequence of block spans covering it.
fn block_spans(offset: u64, length: u64, block_size: u64) -> Vec<BlockSpan> {
    let mut spans = Vec::new();
    let mut processed = 0u64;

    while processed < length {
        let current = offset + processed;
        let block_offset = (current / block_size) * block_size;
        let offset_in_block = (current - block_offset) as usize;
        let chunk = (length - processed).min(block_size - offset_in_block as u64) as usize;

        spans.push(BlockSpan {
            block_offset,
            offset_in_block,
            chunk,
        });
        processed += chunk as u64;
    }

    spans
}

/// S3-backed storage for one NBD connection.
///
/// The RwLock over the dirty-block map doubles as the command gate: reads
/// take it shared, while write and flush take it exclusively so their
/// read-modify-write sequences stay atomic against pipelined reads.
pub struct S3Storage {
    export_name: String,
    block_size: u64,
    s3: Arc<ClientManager>,
    lease: LeaseLock,
    dirty_blocks: RwLock<HashMap<u64, Vec<u8>>>,
}

impl S3Storage {
    /// Create storage for one connection: ensure the bucket exists and take
    /// the export's lease. Fails with `ExportBusy` when another connection
    /// holds a live lease.
    pub async fn create(
        export_name: &str,
        s3: Arc<ClientManager>,
        block_size: u64,
        server_id: &str,
        connection_id: &str,
        lease_duration: Duration,
    ) -> StorageResult<Self> {
        s3.ensure_bucket().await?;

        let lease = LeaseLock::new(
            export_name,
            Arc::clone(&s3),
            server_id,
            connection_id,
            lease_duration,
        );
        if !lease.acquire().await? {
            return Err(StorageError::ExportBusy(export_name.to_string()));
        }

        log::info!(
            "Storage ready: bucket={}, export={}, connection={}",
            s3.bucket(),
            export_name,
            connection_id
        );

        Ok(Self {
            export_name: export_name.to_string(),
            block_size,
            s3,
            lease,
            dirty_blocks: RwLock::new(HashMap::new()),
        })
    }

    fn block_key(&self, block_offset: u64) -> String {
        format!(
            "blocks/{}/{:08x}",
            self.export_name,
            block_offset / self.block_size
        )
    }

    fn check_lease(&self) -> StorageResult<()> {
        match self.lease.state() {
            LeaseState::Active => Ok(()),
            _ => Err(StorageError::LeaseLost(self.export_name.clone())),
        }
    }

    /// Fetch a block image from the object store; an absent object is a zero
    /// block.
    async fn fetch_block(&self, block_offset: u64) -> StorageResult<Vec<u8>> {
        let key = self.block_key(block_offset);
        match self
            .s3
            .client()
            .get_object()
            .bucket(self.s3.bucket())
            .key(&key)
            .send()
            .await
        {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::ObjectStore(e.to_string()))?
                    .to_vec();
                if data.len() != self.block_size as usize {
                    return Err(StorageError::ObjectStore(format!(
                        "block {} has size {}, expected {}",
                        key,
                        data.len(),
                        self.block_size
                    )));
                }
                log::debug!("Read block from store: {} ({} bytes)", key, data.len());
                Ok(data)
            }
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false) =>
            {
                log::debug!("Block not in store, returning zeros: {}", key);
                Ok(vec![0u8; self.block_size as usize])
            }
            Err(err) => Err(object_store_error(err)),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn read(&self, offset: u64, length: u32) -> StorageResult<Vec<u8>> {
        self.check_lease()?;
        let dirty = self.dirty_blocks.read().await;

        let mut result = Vec::with_capacity(length as usize);
        for span in block_spans(offset, u64::from(length), self.block_size) {
            match dirty.get(&span.block_offset) {
                Some(block) => result
                    .extend_from_slice(&block[span.offset_in_block..span.offset_in_block + span.chunk]),
                None => {
                    let block = self.fetch_block(span.block_offset).await?;
                    result.extend_from_slice(
                        &block[span.offset_in_block..span.offset_in_block + span.chunk],
                    );
                }
            }
        }

        Ok(result)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.check_lease()?;
        let mut dirty = self.dirty_blocks.write().await;

        let mut written = 0usize;
        for span in block_spans(offset, data.len() as u64, self.block_size) {
            let mut block = match dirty.remove(&span.block_offset) {
                Some(block) => block,
                None => self.fetch_block(span.block_offset).await?,
            };
            block[span.offset_in_block..span.offset_in_block + span.chunk]
                .copy_from_slice(&data[written..written + span.chunk]);
            dirty.insert(span.block_offset, block);
            written += span.chunk;
        }

        log::debug!(
            "Buffered write: offset={}, length={}, dirty_blocks={}",
            offset,
            data.len(),
            dirty.len()
        );
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.check_lease()?;
        let mut dirty = self.dirty_blocks.write().await;

        if dirty.is_empty() {
            log::debug!("No dirty blocks to flush");
            return Ok(());
        }

        let total = dirty.len();
        log::info!("Flushing {} dirty blocks for export '{}'", total, self.export_name);

        let uploads = dirty.iter().map(|(&block_offset, data)| {
            let client = self.s3.client().clone();
            let bucket = self.s3.bucket().to_string();
            let key = self.block_key(block_offset);
            let body = data.clone();
            async move {
                let result = client
                    .put_object()
                    .bucket(bucket)
                    .key(&key)
                    .body(ByteStream::from(body))
                    .send()
                    .await;
                (block_offset, key, result)
            }
        });
        let results = join_all(uploads).await;

        let mut failed = 0usize;
        for (block_offset, key, result) in results {
            match result {
                Ok(_) => {
                    dirty.remove(&block_offset);
                }
                Err(err) => {
                    failed += 1;
                    log::error!("Failed to upload block {}: {}", key, object_store_error(err));
                }
            }
        }

        if failed > 0 {
            return Err(StorageError::FlushFailed { failed, total });
        }
        log::info!("Flushed {} blocks for export '{}'", total, self.export_name);
        Ok(())
    }

    async fn release(&self) {
        self.lease.release().await;
        log::info!("Released storage for export '{}'", self.export_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S3Config;
    use uuid::Uuid;

    const BS: u64 = 131072;

    #[test]
    fn test_spans_within_one_block() {
        let spans = block_spans(10, 100, BS);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].block_offset, 0);
        assert_eq!(spans[0].offset_in_block, 10);
        assert_eq!(spans[0].chunk, 100);
    }

    #[test]
    fn test_spans_exactly_one_block() {
        let spans = block_spans(BS, BS, BS);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].block_offset, BS);
        assert_eq!(spans[0].offset_in_block, 0);
        assert_eq!(spans[0].chunk, BS as usize);
    }

    #[test]
    fn test_spans_straddling_block_end() {
        // 50 bytes in block 10, 50 bytes in block 11
        let offset = 10 * BS + BS - 50;
        let spans = block_spans(offset, 100, BS);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].block_offset, 10 * BS);
        assert_eq!(spans[0].offset_in_block, (BS - 50) as usize);
        assert_eq!(spans[0].chunk, 50);
        assert_eq!(spans[1].block_offset, 11 * BS);
        assert_eq!(spans[1].offset_in_block, 0);
        assert_eq!(spans[1].chunk, 50);
    }

    #[test]
    fn test_spans_many_blocks() {
        let spans = block_spans(BS / 2, 4 * BS, BS);
        assert_eq!(spans.len(), 5);
        assert_eq!(spans[0].chunk, (BS / 2) as usize);
        assert_eq!(spans[4].chunk, (BS / 2) as usize);
        for pair in spans.windows(2) {
            assert_eq!(pair[1].block_offset, pair[0].block_offset + BS);
        }
        let total: usize = spans.iter().map(|s| s.chunk).sum();
        assert_eq!(total as u64, 4 * BS);
    }

    #[test]
    fn test_spans_zero_length() {
        assert!(block_spans(4096, 0, BS).is_empty());
    }

    // The tests below need a running S3-compatible store (e.g. MinIO with
    // the default credentials) on 127.0.0.1:9000.

    fn test_client() -> Arc<ClientManager> {
        Arc::new(ClientManager::new(&S3Config {
            endpoint_url: "http://127.0.0.1:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket: "s3nbd-test".to_string(),
            region: "us-east-1".to_string(),
        }))
    }

    async fn test_storage(export: &str, connection_id: &str) -> S3Storage {
        S3Storage::create(
            export,
            test_client(),
            BS,
            "test-server",
            connection_id,
            Duration::from_secs(30),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_write_read_round_trip() {
        let export = format!("storage-test-{}", Uuid::new_v4());
        let storage = test_storage(&export, "conn-1").await;

        storage.write(0, b"Hello, NBD!").await.unwrap();
        let data = storage.read(0, 11).await.unwrap();
        assert_eq!(&data, b"Hello, NBD!");
        storage.release().await;
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_flush_persists_across_connections() {
        let export = format!("storage-test-{}", Uuid::new_v4());

        let first = test_storage(&export, "conn-1").await;
        first.write(8192, b"persist-me").await.unwrap();
        first.flush().await.unwrap();
        first.release().await;

        let second = test_storage(&export, "conn-2").await;
        let data = second.read(8192, 10).await.unwrap();
        assert_eq!(&data, b"persist-me");
        second.release().await;
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_unflushed_writes_are_lost() {
        let export = format!("storage-test-{}", Uuid::new_v4());

        let first = test_storage(&export, "conn-1").await;
        first.write(0, b"ephemeral").await.unwrap();
        first.release().await;

        let second = test_storage(&export, "conn-2").await;
        let data = second.read(0, 9).await.unwrap();
        assert_eq!(data, vec![0u8; 9]);
        second.release().await;
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_cross_block_write() {
        let export = format!("storage-test-{}", Uuid::new_v4());
        let storage = test_storage(&export, "conn-1").await;

        let offset = 10 * BS + BS - 50;
        storage.write(offset, &[b'X'; 100]).await.unwrap();
        let data = storage.read(offset, 100).await.unwrap();
        assert_eq!(data, vec![b'X'; 100]);

        // prefix of the written range plus untouched suffix
        let tail = storage.read(offset + 50, 100).await.unwrap();
        assert_eq!(&tail[..50], &[b'X'; 50]);
        assert_eq!(&tail[50..], &[0u8; 50]);
        storage.release().await;
    }

    #[tokio::test]
    #[ignore] // Requires MinIO running
    async fn test_never_written_region_reads_zero() {
        let export = format!("storage-test-{}", Uuid::new_v4());
        let storage = test_storage(&export, "conn-1").await;

        let data = storage.read(16384, 4096).await.unwrap();
        assert_eq!(data, vec![0u8; 4096]);
        storage.release().await;
    }
}
