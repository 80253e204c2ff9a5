//! On-disk storage backend.
//!
//! Layout under the cache directory:
//!
//! ```text
//! index/<sha256(key)>.json   metadata record, the source of truth for an entry
//! content/<sha256(body)>     body bytes, shared by entries with equal bodies
//! tmp/                       staging area; files are renamed into place
//! ```
//!
//! An entry is visible once its index record is renamed into place, which
//! happens only after the body has been fully written. Writes hold a shared
//! guard from the first body byte until the record is in place; pruning takes
//! it exclusively, so it never sees a body whose record is still pending.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{CacheStore, CachedEntry, expiration_for, is_expired};
use crate::error::{FetchCacheError, Result};
use crate::http::{BodyStream, body};
use crate::response::ResponseMetadata;

/// Counter for generating unique temp file names.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn default_cache_directory() -> PathBuf {
    PathBuf::from(".cache")
}

/// Settings for [`FileSystemCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystemCacheConfig {
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,
    #[serde(default, with = "super::opt_millis")]
    pub ttl: Option<Duration>,
}

impl Default for FileSystemCacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: default_cache_directory(),
            ttl: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexRecord {
    #[serde(flatten)]
    meta: ResponseMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<u64>,
    #[serde(default)]
    empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_integrity: Option<String>,
}

/// A filesystem-backed [`CacheStore`].
///
/// Directories are created lazily on first write, so constructing a cache
/// never touches the disk.
pub struct FileSystemCache {
    root: PathBuf,
    ttl: Option<Duration>,
    gc: RwLock<()>,
}

impl FileSystemCache {
    /// A cache rooted at `dir` with no TTL.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            root: dir.as_ref().to_path_buf(),
            ttl: None,
            gc: RwLock::new(()),
        }
    }

    pub fn with_config(config: FileSystemCacheConfig) -> Self {
        Self {
            root: config.cache_directory,
            ttl: config.ttl,
            gc: RwLock::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads an entry even if it has expired. Used to hand back what `set`
    /// just wrote, whatever the TTL.
    pub async fn get_ignoring_expiration(&self, key: &str) -> Result<Option<CachedEntry>> {
        self.read_entry(key, true).await
    }

    /// Deletes body blobs that no index record references. Returns how many
    /// were removed. Waits for in-flight writes to land first.
    pub async fn prune_unreferenced_content(&self) -> Result<usize> {
        let _exclusive = self.gc.write().await;
        let mut referenced = HashSet::new();
        for path in list_dir(&self.index_dir()).await? {
            if let Some(record) = read_record(&path).await? {
                if let Some(integrity) = record.body_integrity {
                    referenced.insert(integrity);
                }
            }
        }

        let mut pruned = 0;
        for path in list_dir(&self.content_dir()).await? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !referenced.contains(name) {
                remove_if_present(&path).await?;
                pruned += 1;
            }
        }
        debug!(pruned, root = %self.root.display(), "pruned unreferenced cache content");
        Ok(pruned)
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn index_path(&self, key: &str) -> PathBuf {
        self.index_dir().join(format!("{}.json", sha256_hex(key.as_bytes())))
    }

    fn content_path(&self, integrity: &str) -> PathBuf {
        self.content_dir().join(integrity)
    }

    fn temp_file_path(&self) -> PathBuf {
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        self.temp_dir().join(format!("tmp.{}.{}", pid, counter))
    }

    async fn read_entry(&self, key: &str, ignore_expiration: bool) -> Result<Option<CachedEntry>> {
        let Some(record) = read_record(&self.index_path(key)).await? else {
            return Ok(None);
        };

        if !ignore_expiration && is_expired(record.expiration) {
            return Ok(None);
        }

        let body = match (&record.body_integrity, record.empty) {
            (Some(integrity), false) => match fs::File::open(self.content_path(integrity)).await {
                Ok(file) => body::from_reader(file),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(key = %key, integrity = %integrity, "cache index points at missing content");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            },
            _ => body::empty(),
        };

        Ok(Some(CachedEntry {
            body,
            meta: record.meta,
        }))
    }

    /// Streams `body` into a temp file, hashing as it goes, and moves it into
    /// the content store. Returns `None` for an empty body.
    async fn write_content(&self, mut body: BodyStream) -> Result<Option<String>> {
        fs::create_dir_all(self.temp_dir()).await?;
        let temp_path = self.temp_file_path();
        let mut file = fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut written = 0usize;

        let copied: std::io::Result<()> = async {
            while let Some(chunk) = body.try_next().await? {
                hasher.update(&chunk);
                written += chunk.len();
                file.write_all(&chunk).await?;
            }
            file.flush().await
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            remove_if_present(&temp_path).await?;
            return Err(e.into());
        }

        if written == 0 {
            remove_if_present(&temp_path).await?;
            return Ok(None);
        }

        let integrity = hex::encode(hasher.finalize());
        fs::create_dir_all(self.content_dir()).await?;
        fs::rename(&temp_path, self.content_path(&integrity)).await?;
        Ok(Some(integrity))
    }

    async fn write_index(&self, key: &str, record: &IndexRecord) -> Result<()> {
        let json = serde_json::to_vec(record)?;
        fs::create_dir_all(self.temp_dir()).await?;
        let temp_path = self.temp_file_path();
        fs::write(&temp_path, json).await?;
        fs::create_dir_all(self.index_dir()).await?;
        fs::rename(&temp_path, self.index_path(key)).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FileSystemCache {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        self.read_entry(key, false).await
    }

    async fn set(
        &self,
        key: &str,
        body: BodyStream,
        meta: ResponseMetadata,
    ) -> Result<CachedEntry> {
        let _writing = self.gc.read().await;
        let integrity = self.write_content(body).await?;
        let record = IndexRecord {
            meta,
            expiration: expiration_for(self.ttl),
            empty: integrity.is_none(),
            body_integrity: integrity,
        };
        self.write_index(key, &record).await?;
        debug!(key = %key, empty = record.empty, "stored entry in filesystem cache");

        // Read back under the guard so the content file is open before any prune.
        self.get_ignoring_expiration(key)
            .await?
            .ok_or_else(|| FetchCacheError::CorruptEntry {
                key: key.to_owned(),
                reason: "entry missing right after it was written".to_owned(),
            })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        remove_if_present(&self.index_path(key)).await?;
        Ok(())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Reads and parses an index record. Missing files are `None`; unparsable
/// records are logged and also treated as missing.
async fn read_record(path: &Path) -> Result<Option<IndexRecord>> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable cache index record");
            Ok(None)
        }
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn meta() -> ResponseMetadata {
        ResponseMetadata {
            url: "http://localhost/image/png".to_owned(),
            status: 200,
            status_text: "OK".to_owned(),
            headers: BTreeMap::from([
                ("content-type".to_owned(), vec!["image/png".to_owned()]),
                ("set-cookie".to_owned(), vec!["a=1".to_owned(), "b=2".to_owned()]),
            ]),
            redirected: true,
            counter: 1,
        }
    }

    fn binary_body() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn round_trips_binary_body_and_metadata() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::new(dir.path());
        let data = binary_body();

        let stored = cache.set("k", body::once(data.clone()), meta()).await.unwrap();
        assert_eq!(stored.meta, meta());
        assert_eq!(body::collect(stored.body).await.unwrap().as_ref(), data.as_slice());

        let hit = cache.get("k").await.unwrap().expect("entry");
        assert_eq!(hit.meta, meta());
        assert_eq!(body::collect(hit.body).await.unwrap().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn missing_key_is_absent() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::new(dir.path().join("never-created"));
        assert!(cache.get("nope").await.unwrap().is_none());
        cache.remove("nope").await.unwrap();
    }

    #[tokio::test]
    async fn empty_body_is_flagged_not_absent() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::new(dir.path());
        cache.set("k", body::empty(), meta()).await.unwrap();

        let raw = std::fs::read(cache.index_path("k")).unwrap();
        let record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record["empty"], true);
        assert!(record.get("bodyIntegrity").is_none());

        let hit = cache.get("k").await.unwrap().expect("entry");
        assert!(body::collect(hit.body).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::with_config(FileSystemCacheConfig {
            cache_directory: dir.path().to_path_buf(),
            ttl: Some(Duration::from_millis(50)),
        });
        cache.set("k", body::once("x"), meta()).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.get_ignoring_expiration("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_ttl_set_still_returns_entry() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::with_config(FileSystemCacheConfig {
            cache_directory: dir.path().to_path_buf(),
            ttl: Some(Duration::ZERO),
        });
        let stored = cache.set("k", body::once("x"), meta()).await.unwrap();
        assert_eq!(body::collect(stored.body).await.unwrap(), "x");
    }

    #[tokio::test]
    async fn remove_then_prune_reclaims_content() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::new(dir.path());
        cache.set("a", body::once("shared"), meta()).await.unwrap();
        cache.set("b", body::once("shared"), meta()).await.unwrap();
        cache.set("c", body::once("only c"), meta()).await.unwrap();

        cache.remove("a").await.unwrap();
        cache.remove("a").await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.prune_unreferenced_content().await.unwrap(), 0);

        cache.remove("c").await.unwrap();
        assert_eq!(cache.prune_unreferenced_content().await.unwrap(), 1);

        let hit = cache.get("b").await.unwrap().expect("b survives");
        assert_eq!(body::collect(hit.body).await.unwrap(), "shared");
    }

    #[tokio::test]
    async fn prune_waits_for_in_flight_set() {
        use futures::StreamExt;
        use std::sync::Arc;
        use tokio::sync::oneshot;

        let dir = TempDir::new().expect("temp dir");
        let cache = Arc::new(FileSystemCache::new(dir.path()));
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (finish_tx, finish_rx) = oneshot::channel::<()>();
        let slow: BodyStream = Box::pin(
            futures::stream::once(async move {
                let _ = started_tx.send(());
                Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"first "))
            })
            .chain(futures::stream::once(async move {
                let _ = finish_rx.await;
                Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"second"))
            })),
        );

        let writer = Arc::clone(&cache);
        let set = tokio::spawn(async move { writer.set("k", slow, meta()).await });
        started_rx.await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), cache.prune_unreferenced_content()).await;
        assert!(blocked.is_err(), "prune ran while a write was in flight");

        finish_tx.send(()).unwrap();
        let stored = set.await.unwrap().unwrap();
        assert_eq!(body::collect(stored.body).await.unwrap(), "first second");

        assert_eq!(cache.prune_unreferenced_content().await.unwrap(), 0);
        let hit = cache.get("k").await.unwrap().expect("entry survives prune");
        assert_eq!(body::collect(hit.body).await.unwrap(), "first second");
    }

    #[tokio::test]
    async fn corrupt_index_reads_as_absent() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::new(dir.path());
        cache.set("k", body::once("x"), meta()).await.unwrap();
        std::fs::write(cache.index_path("k"), b"{not json").unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_body_stream_leaves_no_entry() {
        let dir = TempDir::new().expect("temp dir");
        let cache = FileSystemCache::new(dir.path());
        let failing: BodyStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ]));

        let err = cache.set("k", failing, meta()).await.unwrap_err();
        assert!(matches!(err, FetchCacheError::Storage(_)));
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[test]
    fn config_defaults_directory() {
        let config: FileSystemCacheConfig = serde_json::from_str(r#"{"ttl": 100}"#).unwrap();
        assert_eq!(config.cache_directory, PathBuf::from(".cache"));
        assert_eq!(config.ttl, Some(Duration::from_millis(100)));
    }
}
