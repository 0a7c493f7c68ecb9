use crate::cache::key::is_content_file_name;
use crate::cache::storage::{CacheStorage, REF_SUFFIX, TEMP_SUFFIX, TYPE_SUFFIX};
use crate::config::{CacheConfig, SWEEP_YIELD_EVERY};
use crate::error::{MirrorError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one pass over the cache tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Files looked at
    pub scanned: u64,
    /// Content entries removed (sidecars and temp files are not counted)
    pub removed: u64,
    pub freed_bytes: u64,
    /// Per-file failures that were logged and skipped
    pub errors: u64,
}

impl SweepReport {
    pub fn freed_mb(&self) -> f64 {
        self.freed_bytes as f64 / 1024.0 / 1024.0
    }
}

enum FileKind {
    Content,
    Sidecar { content: PathBuf },
    Temp,
    Other,
}

fn classify(path: &Path) -> FileKind {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return FileKind::Other,
    };

    if is_content_file_name(name) {
        return FileKind::Content;
    }
    if name.ends_with(&format!(".{}", TEMP_SUFFIX)) {
        return FileKind::Temp;
    }
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if (ext == TYPE_SUFFIX || ext == REF_SUFFIX) && is_content_file_name(stem) {
            return FileKind::Sidecar {
                content: path.with_file_name(stem),
            };
        }
    }
    FileKind::Other
}

/// Background TTL eviction over a [`CacheStorage`] tree.
pub struct CacheSweeper {
    cache: Arc<CacheStorage>,
    ttl: Duration,
    interval: Duration,
    retry_backoff: Duration,
}

impl CacheSweeper {
    pub fn new(cache: Arc<CacheStorage>, ttl: Duration, interval: Duration, retry_backoff: Duration) -> Self {
        Self {
            cache,
            ttl,
            interval,
            retry_backoff,
        }
    }

    pub fn from_config(cache: Arc<CacheStorage>, config: &CacheConfig) -> Self {
        Self::new(
            cache,
            config.ttl(),
            config.sweep_interval(),
            config.sweep_retry(),
        )
    }

    /// Start the sweep loop on the runtime. The first sweep runs one interval from now.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Cache sweeper started (ttl: {}s, interval: {}s)",
            self.ttl.as_secs(),
            self.interval.as_secs()
        );

        let mut next = Instant::now() + self.interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            match self.sweep_once(&cancel).await {
                Ok(report) => {
                    info!(
                        "Cache sweep complete: scanned {} files, removed {} entries, freed {:.2} MB ({} errors)",
                        report.scanned,
                        report.removed,
                        report.freed_mb(),
                        report.errors
                    );
                    next = Instant::now() + self.interval;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        "Cache sweep failed, retrying in {}s",
                        self.retry_backoff.as_secs()
                    );
                    next = Instant::now() + self.retry_backoff;
                }
            }
        }

        info!("Cache sweeper stopped");
    }

    /// One pass: delete content older than the TTL along with its sidecars,
    /// plus expired orphan sidecars and abandoned temp files.
    ///
    /// Returns early with a partial report if `cancel` fires.
    pub async fn sweep_once(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let root = self.cache.base_dir().to_path_buf();

        let threshold = match SystemTime::now().checked_sub(self.ttl) {
            Some(threshold) => threshold,
            None => return Ok(report),
        };

        // Only a failure on the root itself fails the sweep
        match fs::metadata(&root).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %root.display(), "Cache directory missing, nothing to sweep");
                return Ok(report);
            }
            Err(e) => {
                return Err(MirrorError::Cache(format!(
                    "Cannot access cache root {}: {}",
                    root.display(),
                    e
                )))
            }
        }

        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Failed to read cache directory");
                    report.errors += 1;
                    continue;
                }
            };

            loop {
                if cancel.is_cancelled() {
                    debug!("Cache sweep interrupted by shutdown");
                    return Ok(report);
                }

                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "Failed to list cache directory");
                        report.errors += 1;
                        break;
                    }
                };

                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    // Deleted alongside its content earlier in this sweep
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to stat cache file");
                        report.errors += 1;
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }

                report.scanned += 1;

                let expired = match metadata.modified() {
                    Ok(modified) => modified < threshold,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Cache file has no modification time");
                        report.errors += 1;
                        continue;
                    }
                };
                if !expired {
                    continue;
                }

                match classify(&path) {
                    FileKind::Content => {
                        match remove_file(&path).await {
                            Ok(()) => {
                                report.removed += 1;
                                report.freed_bytes += metadata.len();
                                report.freed_bytes += self.remove_sidecars(&path, &mut report).await;
                                debug!(path = %path.display(), "Evicted cache entry");

                                if report.removed % SWEEP_YIELD_EVERY as u64 == 0 {
                                    tokio::task::yield_now().await;
                                }
                            }
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "Failed to evict cache entry");
                                report.errors += 1;
                            }
                        }
                    }
                    FileKind::Sidecar { content } => {
                        if fs::try_exists(&content).await.unwrap_or(true) {
                            continue;
                        }
                        self.remove_leftover(&path, metadata.len(), &mut report).await;
                    }
                    FileKind::Temp => {
                        self.remove_leftover(&path, metadata.len(), &mut report).await;
                    }
                    FileKind::Other => {}
                }
            }
        }

        Ok(report)
    }

    async fn remove_sidecars(&self, content: &Path, report: &mut SweepReport) -> u64 {
        let name = match content.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return 0,
        };

        let mut freed = 0;
        for suffix in [TYPE_SUFFIX, REF_SUFFIX] {
            let sidecar = content.with_file_name(format!("{}.{}", name, suffix));
            let size = match fs::metadata(&sidecar).await {
                Ok(metadata) => metadata.len(),
                Err(_) => continue,
            };
            match remove_file(&sidecar).await {
                Ok(()) => freed += size,
                Err(e) => {
                    warn!(path = %sidecar.display(), error = %e, "Failed to remove cache sidecar");
                    report.errors += 1;
                }
            }
        }
        freed
    }

    async fn remove_leftover(&self, path: &Path, size: u64, report: &mut SweepReport) {
        match remove_file(path).await {
            Ok(()) => {
                report.freed_bytes += size;
                debug!(path = %path.display(), "Removed stale cache file");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove stale cache file");
                report.errors += 1;
            }
        }
    }
}

/// Delete a file; one that is already gone counts as deleted
async fn remove_file(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
