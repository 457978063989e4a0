use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{Blob, BlobDigest, BlobInfo, ByteStream, KvStore, Swap};
use crate::config::STREAM_CHUNK;
use crate::error::{StoreError, StoreResult};

/// Process-local store. Conditional writes compare bytes under the write lock.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
    blobs: RwLock<HashMap<String, (BlobInfo, Bytes)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn chunked(data: Bytes) -> ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
        .step_by(STREAM_CHUNK)
        .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK).min(data.len()))))
        .collect();
    stream::iter(chunks).boxed()
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn put_if_unchanged(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> StoreResult<Swap> {
        let mut values = self.values.write().await;
        if values.get(key).map(Vec::as_slice) != expected {
            return Ok(Swap::Conflict);
        }
        values.insert(key.to_string(), new.to_vec());
        Ok(Swap::Committed)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let values = self.values.read().await;
        let mut keys: Vec<String> = values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_stream(&self, key: &str) -> StoreResult<Option<Blob>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(key).map(|(info, data)| Blob {
            info: info.clone(),
            body: chunked(data.clone()),
        }))
    }

    async fn put_stream(
        &self,
        key: &str,
        mut body: ByteStream,
        metadata: BTreeMap<String, String>,
    ) -> StoreResult<BlobInfo> {
        let mut buffer = BytesMut::new();
        let mut digest = BlobDigest::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StoreError::Source(e.to_string()))?;
            digest.update(&chunk);
            buffer.extend_from_slice(&chunk);
        }

        let info = digest.finish(metadata);
        self.blobs
            .write()
            .await
            .insert(key.to_string(), (info.clone(), buffer.freeze()));
        Ok(info)
    }

    async fn blob_info(&self, key: &str) -> StoreResult<Option<BlobInfo>> {
        Ok(self.blobs.read().await.get(key).map(|(info, _)| info.clone()))
    }
}
