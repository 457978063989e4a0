//! Asset Registry: the single archive handed out on redemption.
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{ASSET_CONTENT_TYPE, ASSET_FILENAME, ASSET_KEY};
use crate::error::{Result, StoreError, VaultError};
use crate::store::{BlobInfo, ByteStream, KvStore};

const UPLOADED_AT: &str = "uploaded_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetInfo {
    pub size: u64,
    pub sha256: String,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub filename: &'static str,
    pub content_type: &'static str,
}

impl From<BlobInfo> for AssetInfo {
    fn from(blob: BlobInfo) -> Self {
        let uploaded_at = blob
            .metadata
            .get(UPLOADED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            size: blob.size,
            sha256: blob.sha256,
            uploaded_at,
            filename: ASSET_FILENAME,
            content_type: ASSET_CONTENT_TYPE,
        }
    }
}

/// An opened asset, ready to be streamed to one caller.
pub struct AssetHandle {
    pub info: AssetInfo,
    pub body: ByteStream,
}

impl std::fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetHandle")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct AssetRegistry {
    store: Arc<dyn KvStore>,
}

impl AssetRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Replace the asset with `body`. Empty uploads are refused before
    /// anything is written.
    pub async fn publish(&self, mut body: ByteStream) -> Result<AssetInfo> {
        let first = loop {
            match body.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => break chunk,
                Some(Err(e)) => return Err(StoreError::Source(e.to_string()).into()),
                None => return Err(VaultError::EmptyAsset),
            }
        };
        let body = stream::once(async move { Ok::<_, std::io::Error>(first) }).chain(body).boxed();

        let mut metadata = BTreeMap::new();
        metadata.insert(UPLOADED_AT.to_string(), Utc::now().to_rfc3339());

        let info = AssetInfo::from(self.store.put_stream(ASSET_KEY, body, metadata).await?);
        info!("Published asset: {} bytes, sha256 {}", info.size, info.sha256);
        Ok(info)
    }

    /// Open the current asset for streaming, `None` if nothing was published.
    pub async fn fetch(&self) -> Result<Option<AssetHandle>> {
        Ok(self.store.get_stream(ASSET_KEY).await?.map(|blob| AssetHandle {
            info: blob.info.into(),
            body: blob.body,
        }))
    }

    pub async fn info(&self) -> Result<Option<AssetInfo>> {
        Ok(self.store.blob_info(ASSET_KEY).await?.map(AssetInfo::from))
    }
}
