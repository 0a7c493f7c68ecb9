use crate::cache::key::{is_content_file_name, ArtifactClass, CacheKey};
use crate::config::DEFAULT_BLOB_CONTENT_TYPE;
use crate::error::{MirrorError, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

/// Sidecar holding the declared content type
pub const TYPE_SUFFIX: &str = "type";

/// Sidecar holding the repository and reference an entry was fetched for
pub const REF_SUFFIX: &str = "ref";

/// Suffix of in-progress writes; never served
pub const TEMP_SUFFIX: &str = "tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A cache hit: an open handle on the content file plus its metadata.
///
/// The handle belongs to the caller; dropping the entry closes the file.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub content_type: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub file: File,
}

impl CacheEntry {
    /// Read the whole entry into memory (manifests, tests)
    pub async fn read_to_end(mut self) -> std::io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut data).await?;
        Ok(data)
    }
}

/// Removes a partially written file unless the write was committed.
///
/// Runs on error returns and when the writing future is dropped mid-copy.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed incomplete cache file");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove incomplete cache file"
                );
            }
        }
    }
}

/// Disk-backed artifact store with separate manifest and blob subtrees.
///
/// Layout: `{base}/manifests/{hash}`, `{base}/blobs/{hash}`, each with
/// `{hash}.type` and `{hash}.ref` sidecars.
pub struct CacheStorage {
    base_dir: PathBuf,
    manifests_dir: PathBuf,
    blobs_dir: PathBuf,
}

impl CacheStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let manifests_dir = base_dir.join(ArtifactClass::Manifest.dir_name());
        let blobs_dir = base_dir.join(ArtifactClass::Blob.dir_name());

        std::fs::create_dir_all(&manifests_dir).map_err(|e| {
            MirrorError::Cache(format!("Failed to create manifests dir: {}", e))
        })?;
        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| MirrorError::Cache(format!("Failed to create blobs dir: {}", e)))?;

        Ok(Self {
            base_dir,
            manifests_dir,
            blobs_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn class_dir(&self, class: ArtifactClass) -> &Path {
        match class {
            ArtifactClass::Manifest => &self.manifests_dir,
            ArtifactClass::Blob => &self.blobs_dir,
        }
    }

    pub fn content_path(&self, key: &CacheKey) -> PathBuf {
        self.class_dir(key.class()).join(key.hash())
    }

    pub fn type_path(&self, key: &CacheKey) -> PathBuf {
        self.sidecar_path(key, TYPE_SUFFIX)
    }

    pub fn ref_path(&self, key: &CacheKey) -> PathBuf {
        self.sidecar_path(key, REF_SUFFIX)
    }

    fn sidecar_path(&self, key: &CacheKey, suffix: &str) -> PathBuf {
        self.class_dir(key.class())
            .join(format!("{}.{}", key.hash(), suffix))
    }

    /// Unique temp name next to the destination so the final rename stays on one filesystem
    fn temp_path(&self, dest: &Path) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = dest
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!(
            "{}.{}-{}.{}",
            name,
            std::process::id(),
            n,
            TEMP_SUFFIX
        ))
    }

    /// Look up an entry. Any failure to open it is reported as a miss.
    pub async fn try_read(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.content_path(key);

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    repository = %key.repository(),
                    reference = %key.reference(),
                    error = %e,
                    "Cache entry unreadable - treating as miss"
                );
                return None;
            }
        };

        let metadata = match file.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to stat cache entry - treating as miss");
                return None;
            }
        };

        let content_type = match fs::read_to_string(self.type_path(key)).await {
            Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
            Ok(_) => DEFAULT_BLOB_CONTENT_TYPE.to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => DEFAULT_BLOB_CONTENT_TYPE.to_string(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read content type sidecar");
                DEFAULT_BLOB_CONTENT_TYPE.to_string()
            }
        };

        Some(CacheEntry {
            key: key.clone(),
            content_type,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            file,
        })
    }

    /// Persist a fully buffered artifact (manifests)
    pub async fn write_bytes(&self, key: &CacheKey, content_type: &str, data: &[u8]) -> Result<u64> {
        let stream = futures::stream::once(async move {
            Ok::<_, MirrorError>(Bytes::copy_from_slice(data))
        });
        self.write_stream(key, content_type, stream, data.len().max(1))
            .await
    }

    /// Stream an artifact to disk and publish it atomically.
    ///
    /// Content goes to a unique temp file which is synced and renamed over the
    /// final name; the content type and origin sidecars follow. If the stream
    /// yields an error, or this future is dropped, the temp file is removed and
    /// the previous entry (if any) is left untouched.
    pub async fn write_stream<S, E>(
        &self,
        key: &CacheKey,
        content_type: &str,
        stream: S,
        buffer_size: usize,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<MirrorError>,
    {
        let dest = self.content_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                MirrorError::Cache(format!("Failed to create cache dir: {}", e))
            })?;
        }

        let temp_path = self.temp_path(&dest);
        let mut guard = TempFileGuard::new(temp_path.clone());

        let file = File::create(&temp_path).await.map_err(|e| {
            MirrorError::Cache(format!("Failed to create cache file for {}: {}", key, e))
        })?;
        let mut writer = BufWriter::with_capacity(buffer_size, file);

        futures::pin_mut!(stream);
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::into)?;
            writer.write_all(&chunk).await.map_err(|e| {
                MirrorError::Cache(format!("Failed to write cache file for {}: {}", key, e))
            })?;
            written += chunk.len() as u64;
        }

        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all()
            .await
            .map_err(|e| MirrorError::Cache(format!("Failed to sync cache file: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, &dest).await.map_err(|e| {
            MirrorError::Cache(format!("Failed to publish cache entry {}: {}", key, e))
        })?;
        guard.disarm();

        if let Err(e) = self.write_sidecars(key, content_type).await {
            // Content without a correct type would be served as octet-stream forever
            match fs::remove_file(&dest).await {
                Ok(()) => {}
                Err(remove) if remove.kind() == ErrorKind::NotFound => {}
                Err(remove) => {
                    tracing::warn!(
                        key = %key,
                        path = %dest.display(),
                        error = %remove,
                        "Failed to roll back cache entry after sidecar write failure"
                    );
                }
            }
            return Err(e);
        }

        tracing::debug!(
            key = %key,
            repository = %key.repository(),
            reference = %key.reference(),
            size = written,
            "Cache entry written"
        );

        Ok(written)
    }

    async fn write_sidecars(&self, key: &CacheKey, content_type: &str) -> Result<()> {
        self.write_small_file(&self.type_path(key), content_type.as_bytes())
            .await?;
        let origin = format!("{}\n{}\n", key.repository(), key.reference());
        self.write_small_file(&self.ref_path(key), origin.as_bytes())
            .await
    }

    async fn write_small_file(&self, dest: &Path, data: &[u8]) -> Result<()> {
        let temp_path = self.temp_path(dest);
        let mut guard = TempFileGuard::new(temp_path.clone());
        fs::write(&temp_path, data).await.map_err(|e| {
            MirrorError::Cache(format!("Failed to write {}: {}", dest.display(), e))
        })?;
        fs::rename(&temp_path, dest).await.map_err(|e| {
            MirrorError::Cache(format!("Failed to rename {}: {}", dest.display(), e))
        })?;
        guard.disarm();
        Ok(())
    }

    /// Hashes of every stored content file of one class
    pub async fn list_keys(&self, class: ArtifactClass) -> Result<Vec<String>> {
        let dir = self.class_dir(class);
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MirrorError::Cache(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                if is_content_file_name(&name) {
                    keys.push(name);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Repositories with at least one cached manifest, sorted and de-duplicated
    pub async fn list_repositories(&self) -> Result<Vec<String>> {
        let mut repositories = BTreeSet::new();

        for hash in self.list_keys(ArtifactClass::Manifest).await? {
            let ref_path = self
                .manifests_dir
                .join(format!("{}.{}", hash, REF_SUFFIX));
            match fs::read_to_string(&ref_path).await {
                Ok(raw) => {
                    if let Some(repository) = raw.lines().next().map(str::trim) {
                        if !repository.is_empty() {
                            repositories.insert(repository.to_string());
                        }
                    }
                }
                // Evicted between listing and read, or written before origins were recorded
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        path = %ref_path.display(),
                        error = %e,
                        "Failed to read manifest origin"
                    );
                }
            }
        }

        Ok(repositories.into_iter().collect())
    }
}
