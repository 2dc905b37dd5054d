use crate::access_time::AccessTimeTracker;
use crate::error::Result;
use crate::path_guard::{PathGuard, ResolvedPath};
use crate::util::{atomic_write, atomic_write_stream, remove_file_best_effort, BINCODE_PAYLOAD_LIMIT_BYTES};
use crate::LOG_TARGET;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncRead;

/// Result of a metadata-only presence probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheElementStatus {
    Available,
    NotAvailable,
}

/// A cache hit: an open handle to the backing file and its size.
///
/// The file is closed when the item is dropped; closing never fails the read
/// that produced it.
#[derive(Debug)]
pub struct CacheItem {
    pub body: tokio::fs::File,
    pub size: u64,
}

/// Diagnostic counters. Not persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub invalidations: u64,
    pub evicted_files: u64,
    /// Bytes reclaimed by eviction since the process started.
    pub total_cleaned: u64,
    /// On-disk usage measured by the most recent scan.
    pub last_observed_usage: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    invalidations: AtomicU64,
    evicted_files: AtomicU64,
    total_cleaned: AtomicU64,
    last_observed_usage: AtomicU64,
}

/// The on-disk cache tree rooted at a single directory.
///
/// Every operation validates its key through [`PathGuard`] before any
/// filesystem call, and every successful `put`/`get` refreshes the key's
/// access time.
#[derive(Debug)]
pub struct CacheStore {
    guard: PathGuard,
    tracker: Arc<AccessTimeTracker>,
    counters: Counters,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_tracker(root, Arc::new(AccessTimeTracker::new()))
    }

    pub fn with_tracker(root: impl Into<PathBuf>, tracker: Arc<AccessTimeTracker>) -> Self {
        Self {
            guard: PathGuard::new(root),
            tracker,
            counters: Counters::default(),
        }
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn tracker(&self) -> &Arc<AccessTimeTracker> {
        &self.tracker
    }

    /// Streams `reader` into the cache under `key`, replacing any previous
    /// version atomically. Returns the number of bytes written.
    pub async fn put<R>(&self, key: impl AsRef<Path>, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let resolved = self.guard.validate(key)?;
        let index_key = resolved.index_key();

        // The timestamp is recorded before the rename so a concurrent sweep
        // never sees the new file without an access time.
        let written = atomic_write_stream(resolved.path(), reader, || {
            self.tracker.add_timestamp(&index_key, SystemTime::now())
        })
        .await
        .inspect_err(|err| {
            tracing::debug!(
                target: LOG_TARGET,
                key = %index_key,
                error = %err,
                "failed to write cache entry"
            );
        })?;

        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: LOG_TARGET, key = %index_key, bytes = written, "cached object");
        Ok(written)
    }

    pub async fn put_bytes(&self, key: impl AsRef<Path>, bytes: &[u8]) -> Result<u64> {
        let mut reader = bytes;
        self.put(key, &mut reader).await
    }

    /// Opens the cached file for `key`, or returns `None` on a miss.
    pub async fn get(&self, key: impl AsRef<Path>) -> Result<Option<CacheItem>> {
        let resolved = self.guard.validate(key)?;

        let body = match tokio::fs::File::open(resolved.path()).await {
            Ok(file) => file,
            Err(err) if is_missing(&err) => return Ok(self.miss()),
            Err(err) => return Err(err.into()),
        };
        let meta = body.metadata().await?;
        if !meta.is_file() {
            return Ok(self.miss());
        }

        self.tracker
            .add_timestamp(&resolved.index_key(), SystemTime::now());
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(CacheItem {
            body,
            size: meta.len(),
        }))
    }

    /// Reports whether `key` is present without opening it.
    pub async fn is_cached(&self, key: impl AsRef<Path>) -> Result<CacheElementStatus> {
        let resolved = self.guard.validate(key)?;
        match tokio::fs::metadata(resolved.path()).await {
            Ok(meta) if meta.is_file() => Ok(CacheElementStatus::Available),
            Ok(_) => Ok(CacheElementStatus::NotAvailable),
            Err(err) if is_missing(&err) => Ok(CacheElementStatus::NotAvailable),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes `key` and any directories that become empty as a result.
    ///
    /// Invalidating an absent key succeeds without touching the filesystem.
    pub async fn invalidate(&self, key: impl AsRef<Path>) -> Result<()> {
        let resolved = self.guard.validate(key)?;
        if self.remove_entry(&resolved).await?.is_some() {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Deletes the file behind `resolved`, forgets its access time and prunes
    /// now-empty ancestors. Returns the size of the removed file, or `None`
    /// when there was nothing to remove (including losing a race with another
    /// deleter).
    pub(crate) async fn remove_entry(&self, resolved: &ResolvedPath) -> Result<Option<u64>> {
        let meta = match tokio::fs::symlink_metadata(resolved.path()).await {
            Ok(meta) => meta,
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            tracing::debug!(
                target: LOG_TARGET,
                path = %resolved.path().display(),
                "refusing to remove directory as a cache entry"
            );
            return Ok(None);
        }

        // A put that lands between the unlink and the forget refreshes the
        // estimate; that entry must survive.
        let index_key = resolved.index_key();
        let seen = self.tracker.estimate_timestamp(&index_key);
        match tokio::fs::remove_file(resolved.path()).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        self.tracker.remove_timestamp_if_not_newer(&index_key, seen);
        self.prune_empty_parents(resolved).await;
        Ok(Some(meta.len()))
    }

    /// Walks from the entry's directory towards the root, removing each empty
    /// directory. Stops at the first non-empty one; never removes the root.
    async fn prune_empty_parents(&self, resolved: &ResolvedPath) {
        for dir in resolved.ancestor_dirs(self.guard.root()) {
            match dir_is_empty(&dir).await {
                Ok(true) => {}
                Ok(false) => break,
                // Already pruned by a concurrent deleter; keep climbing.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        dir = %dir.display(),
                        error = %err,
                        "failed to inspect cache directory while pruning"
                    );
                    break;
                }
            }

            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                // A concurrent put repopulated it.
                Err(_) => break,
            }
        }
    }

    /// Loads the persisted access-time index. A missing file is not an error;
    /// a corrupt one is discarded and the table starts empty.
    pub async fn load_access_times(&self) -> Result<bool> {
        let path = self.guard.index_path();
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if meta.len() > BINCODE_PAYLOAD_LIMIT_BYTES as u64 {
            tracing::warn!(
                target: LOG_TARGET,
                path = %path.display(),
                bytes = meta.len(),
                "access-time index too large; starting empty"
            );
            remove_file_best_effort(&path, "load_access_times.oversize").await;
            return Ok(false);
        }

        let bytes = tokio::fs::read(&path).await?;
        match self.tracker.deserialize(&bytes) {
            Ok(()) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    entries = self.tracker.len(),
                    "loaded access-time index"
                );
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    error = %err,
                    "corrupt access-time index; starting empty"
                );
                remove_file_best_effort(&path, "load_access_times.corrupt").await;
                Ok(false)
            }
        }
    }

    /// Persists the access-time index with the same atomic write as `put`.
    pub async fn save_access_times(&self) -> Result<()> {
        // Cleared first so updates racing with the write re-mark the table.
        self.tracker.mark_clean();
        let result = match self.tracker.serialize() {
            Ok(bytes) => atomic_write(&self.guard.index_path(), &bytes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.tracker.mark_dirty();
            return Err(err);
        }
        Ok(())
    }

    /// Process-lifetime total of bytes reclaimed by eviction.
    pub fn total_cleaned(&self) -> u64 {
        self.counters.total_cleaned.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            puts: c.puts.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            evicted_files: c.evicted_files.load(Ordering::Relaxed),
            total_cleaned: c.total_cleaned.load(Ordering::Relaxed),
            last_observed_usage: c.last_observed_usage.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_eviction(&self, files: u64, bytes: u64) {
        self.counters.evicted_files.fetch_add(files, Ordering::Relaxed);
        self.counters.total_cleaned.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_usage(&self, bytes: u64) {
        self.counters
            .last_observed_usage
            .store(bytes, Ordering::Relaxed);
    }

    fn miss(&self) -> Option<CacheItem> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }
}

fn is_missing(err: &io::Error) -> bool {
    // `a/b` where `a` is a regular file surfaces as ENOTDIR.
    err.kind() == io::ErrorKind::NotFound || err.kind() == io::ErrorKind::NotADirectory
}

async fn dir_is_empty(dir: &Path) -> io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}

impl From<&CacheStore> for CacheStats {
    fn from(store: &CacheStore) -> Self {
        store.stats()
    }
}
