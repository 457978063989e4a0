//! Storage contract the ledger and the asset registry are written against.
//!
//! Two namespaces live behind one trait: small values addressed by string keys
//! (token records) and streamed blobs (the published archive). All state of
//! the system is here, so the conditional write is what keeps concurrent
//! redemptions honest.
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::StoreResult;

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// Lazily produced bytes of a blob.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swap {
    Committed,
    /// The stored value was not the expected one; nothing was written.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub size: u64,
    /// Hex SHA-256 of the blob contents
    pub sha256: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

pub struct Blob {
    pub info: BlobInfo,
    pub body: ByteStream,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob").field("info", &self.info).finish_non_exhaustive()
    }
}

/// Key-value store with compare-and-swap and streamed blobs.
///
/// Implementations must be safe for concurrent use; `put_if_unchanged` has to
/// be linearizable per key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Unconditional write.
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Write `new` only if the current value equals `expected`.
    ///
    /// `expected = None` means the key must not exist yet.
    async fn put_if_unchanged(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> StoreResult<Swap>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn get_stream(&self, key: &str) -> StoreResult<Option<Blob>>;

    /// Replace the blob under `key` with the contents of `body`.
    ///
    /// Readers see either the previous blob or the new one, never a mix.
    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        metadata: BTreeMap<String, String>,
    ) -> StoreResult<BlobInfo>;

    async fn blob_info(&self, key: &str) -> StoreResult<Option<BlobInfo>>;
}

/// Running size and digest of a blob being written.
#[derive(Default)]
pub(crate) struct BlobDigest {
    hasher: Sha256,
    size: u64,
}

impl BlobDigest {
    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub(crate) fn finish(self, metadata: BTreeMap<String, String>) -> BlobInfo {
        BlobInfo {
            size: self.size,
            sha256: hex::encode(self.hasher.finalize()),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_digest_matches_whole_input() {
        let mut digest = BlobDigest::default();
        digest.update(b"hello ");
        digest.update(b"world");
        let info = digest.finish(BTreeMap::new());

        assert_eq!(info.size, 11);
        assert_eq!(info.sha256, hex::encode(Sha256::digest(b"hello world")));
    }
}
