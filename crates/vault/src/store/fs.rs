use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{Blob, BlobDigest, BlobInfo, ByteStream, KvStore, Swap};
use crate::config::STREAM_CHUNK;
use crate::error::{StoreError, StoreResult};

const VALUES_DIR: &str = "kv";
const BLOBS_DIR: &str = "blobs";
const OPEN_RETRIES: usize = 3;

/// Points at the blob generation that is currently published.
#[derive(Serialize, Deserialize)]
struct BlobPointer {
    generation: String,
    info: BlobInfo,
}

/// Directory-backed store.
///
/// Every key becomes a hex-named file, so arbitrary keys cannot escape the
/// directory. Files are replaced by writing a temp file and renaming it.
/// Writes go through one mutex, which makes compare-then-rename atomic for
/// this process. The directory must not be shared with another process.
pub struct FsStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsStore {
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(VALUES_DIR)).await?;
        fs::create_dir_all(root.join(BLOBS_DIR)).await?;
        info!("Opened file store at {}", root.display());

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join(VALUES_DIR).join(hex::encode(key))
    }

    fn pointer_path(&self, key: &str) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(format!("{}.json", hex::encode(key)))
    }

    fn generation_path(&self, key: &str, generation: &str) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(format!("{}.{}.bin", hex::encode(key), generation))
    }

    async fn read_pointer(&self, key: &str) -> StoreResult<Option<BlobPointer>> {
        match read_optional(&self.pointer_path(key)).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("blob pointer for {}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn write_generation(
        &self,
        path: &Path,
        mut body: ByteStream,
        metadata: BTreeMap<String, String>,
    ) -> StoreResult<BlobInfo> {
        let mut file = File::create(path).await?;
        let mut digest = BlobDigest::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StoreError::Source(e.to_string()))?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        Ok(digest.finish(metadata))
    }
}

async fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a sibling temp file, sync, then rename over `path`.
async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let temp_path = path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
    let result = async {
        let mut file = File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl KvStore for FsStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        read_optional(&self.value_path(key)).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.value_path(key), value).await
    }

    async fn put_if_unchanged(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> StoreResult<Swap> {
        let path = self.value_path(key);
        let _guard = self.write_lock.lock().await;

        let current = read_optional(&path).await?;
        if current.as_deref() != expected {
            return Ok(Swap::Conflict);
        }
        write_atomic(&path, new).await?;
        Ok(Swap::Committed)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut entries = fs::read_dir(self.root.join(VALUES_DIR)).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            // Temp files carry an extension and never decode
            let Some(key) = name
                .to_str()
                .and_then(|n| hex::decode(n).ok())
                .and_then(|raw| String::from_utf8(raw).ok())
            else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_stream(&self, key: &str) -> StoreResult<Option<Blob>> {
        for _ in 0..OPEN_RETRIES {
            let Some(pointer) = self.read_pointer(key).await? else {
                return Ok(None);
            };
            match File::open(self.generation_path(key, &pointer.generation)).await {
                Ok(file) => {
                    return Ok(Some(Blob {
                        info: pointer.info,
                        body: ReaderStream::with_capacity(file, STREAM_CHUNK).boxed(),
                    }))
                }
                // Replaced between reading the pointer and opening the data
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Blob generation {} for {} vanished, re-reading pointer", pointer.generation, key);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Io(format!(
            "blob {} kept changing while it was being opened",
            key
        )))
    }

    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        metadata: BTreeMap<String, String>,
    ) -> StoreResult<BlobInfo> {
        let generation = format!(
            "{}-{:08x}",
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u32>()
        );
        let data_path = self.generation_path(key, &generation);

        let info = match self.write_generation(&data_path, body, metadata).await {
            Ok(info) => info,
            Err(e) => {
                let _ = fs::remove_file(&data_path).await;
                return Err(e);
            }
        };

        let pointer = BlobPointer { generation, info };
        let encoded = serde_json::to_vec_pretty(&pointer)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let previous = {
            let _guard = self.write_lock.lock().await;
            let previous = match self.read_pointer(key).await {
                Ok(previous) => previous,
                Err(e) => {
                    warn!(
                        "Unreadable pointer for {}, its blob generation will not be removed: {}",
                        key, e
                    );
                    None
                }
            };
            if let Err(e) = write_atomic(&self.pointer_path(key), &encoded).await {
                let _ = fs::remove_file(&data_path).await;
                return Err(e);
            }
            previous
        };

        if let Some(old) = previous {
            if let Err(e) = fs::remove_file(self.generation_path(key, &old.generation)).await {
                warn!("Failed to remove superseded blob generation {}: {}", old.generation, e);
            }
        }

        Ok(pointer.info)
    }

    async fn blob_info(&self, key: &str) -> StoreResult<Option<BlobInfo>> {
        Ok(self.read_pointer(key).await?.map(|p| p.info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;

    async fn open_temp() -> (FsStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        (store, dir)
    }

    fn body_of(data: &[u8]) -> ByteStream {
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(5)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks).boxed()
    }

    async fn read_all(blob: Blob) -> Vec<u8> {
        let chunks: Vec<Bytes> = blob.body.map(|c| c.unwrap()).collect().await;
        chunks.concat()
    }

    #[tokio::test]
    async fn test_values_persist_across_reopen() {
        let (store, dir) = open_temp().await;
        store.put("token:abc", b"{\"remaining\":3}").await.unwrap();
        drop(store);

        let reopened = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("token:abc").await.unwrap(),
            Some(b"{\"remaining\":3}".to_vec())
        );
        assert_eq!(reopened.get("token:missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (store, _dir) = open_temp().await;

        assert_eq!(
            store.put_if_unchanged("cas", None, b"initial").await.unwrap(),
            Swap::Committed
        );
        assert_eq!(
            store.put_if_unchanged("cas", None, b"second").await.unwrap(),
            Swap::Conflict
        );
        assert_eq!(
            store.put_if_unchanged("cas", Some(&b"wrong"[..]), b"new").await.unwrap(),
            Swap::Conflict
        );
        assert_eq!(
            store.put_if_unchanged("cas", Some(&b"initial"[..]), b"updated").await.unwrap(),
            Swap::Committed
        );
        assert_eq!(store.get("cas").await.unwrap(), Some(b"updated".to_vec()));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let (store, dir) = open_temp().await;
        store.put("../../etc/passwd", b"nope").await.unwrap();

        assert_eq!(
            store.list("../").await.unwrap(),
            vec!["../../etc/passwd".to_string()]
        );
        assert!(!dir.path().parent().unwrap().join("etc").exists());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_files() {
        let (store, dir) = open_temp().await;
        store.put("token:one", b"1").await.unwrap();
        store.put("token:two", b"2").await.unwrap();
        std::fs::write(dir.path().join(VALUES_DIR).join("junk.tmp-1"), b"x").unwrap();

        assert_eq!(
            store.list("token:").await.unwrap(),
            vec!["token:one".to_string(), "token:two".to_string()]
        );
    }

    #[tokio::test]
    async fn test_blob_replace_keeps_open_reader_consistent() {
        let (store, _dir) = open_temp().await;
        let first = store
            .put_stream("asset", body_of(b"first version"), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(first.size, 13);

        let reader = store.get_stream("asset").await.unwrap().unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert("uploaded_at".to_string(), "now".to_string());
        let second = store
            .put_stream("asset", body_of(b"second"), metadata)
            .await
            .unwrap();

        // The already opened handle still streams the old generation
        assert_eq!(read_all(reader).await, b"first version".to_vec());

        let fresh = store.get_stream("asset").await.unwrap().unwrap();
        assert_eq!(fresh.info, second);
        assert_eq!(read_all(fresh).await, b"second".to_vec());
        assert_eq!(store.blob_info("asset").await.unwrap().unwrap().size, 6);
    }

    #[tokio::test]
    async fn test_republish_over_unreadable_pointer() {
        let (store, _dir) = open_temp().await;
        store
            .put_stream("asset", body_of(b"old"), BTreeMap::new())
            .await
            .unwrap();
        std::fs::write(store.pointer_path("asset"), b"{ not a pointer").unwrap();
        assert!(matches!(
            store.blob_info("asset").await,
            Err(StoreError::Serialization(_))
        ));

        let info = store
            .put_stream("asset", body_of(b"replacement"), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(info.size, 11);

        let blob = store.get_stream("asset").await.unwrap().unwrap();
        assert_eq!(read_all(blob).await, b"replacement".to_vec());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_previous_blob() {
        let (store, _dir) = open_temp().await;
        store
            .put_stream("asset", body_of(b"good"), BTreeMap::new())
            .await
            .unwrap();

        let broken: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "client went away")),
        ])
        .boxed();
        let err = store
            .put_stream("asset", broken, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Source(_)));

        let blob = store.get_stream("asset").await.unwrap().unwrap();
        assert_eq!(read_all(blob).await, b"good".to_vec());
    }
}
