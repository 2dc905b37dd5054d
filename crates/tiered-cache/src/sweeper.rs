//! Background reclamation of cache space.
//!
//! A sweep scans the whole tree, and if usage exceeds the budget, deletes the
//! least recently accessed files until usage is back at the target. Staging
//! files and the access-time index are invisible to the scan.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::path_guard::{PathGuard, ResolvedPath, ACCESS_TIME_INDEX_FILENAME};
use crate::store::CacheStore;
use crate::util::is_temp_file_name;
use crate::LOG_TARGET;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Outcome of one [`EvictionSweeper::sweep_once`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub usage_before: u64,
    pub usage_after: u64,
    pub deleted_files: usize,
    pub deleted_bytes: u64,
    /// Candidates that could not be removed; the sweep moved past them.
    pub failed: usize,
}

/// What startup cleanup removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StartupCleanupReport {
    pub removed_temp_files: usize,
    pub removed_dirs: usize,
    pub dropped_index_entries: usize,
}

#[derive(Debug)]
struct ScannedFile {
    resolved: ResolvedPath,
    size: u64,
}

#[derive(Clone, Debug)]
pub struct EvictionSweeper {
    store: Arc<CacheStore>,
    max_size: u64,
    target_size: u64,
}

impl EvictionSweeper {
    pub fn new(store: Arc<CacheStore>, config: &CacheConfig) -> Self {
        Self::with_limits(store, config.max_cache_size.0, config.target_size())
    }

    /// `target_size` is clamped to `max_size`.
    pub fn with_limits(store: Arc<CacheStore>, max_size: u64, target_size: u64) -> Self {
        Self {
            store,
            max_size,
            target_size: target_size.min(max_size),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Sums the sizes of all cached files currently on disk.
    pub async fn measure_usage(&self) -> Result<u64> {
        let files = self.scan().await?;
        let usage = total_size(&files);
        self.store.record_usage(usage);
        Ok(usage)
    }

    /// Runs a single eviction pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let files = self.scan().await?;
        let usage = total_size(&files);
        self.store.record_usage(usage);

        let mut report = SweepReport {
            usage_before: usage,
            usage_after: usage,
            ..SweepReport::default()
        };
        if usage <= self.max_size {
            return Ok(report);
        }

        // Oldest first; unknown access times rank before everything else and
        // ties fall back to key order.
        let tracker = self.store.tracker();
        let mut ranked: Vec<_> = files
            .into_iter()
            .map(|file| {
                let key = file.resolved.index_key();
                (tracker.estimate_timestamp(&key), key, file)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut remaining = usage;
        for (_, key, file) in ranked {
            if remaining <= self.target_size {
                break;
            }
            match self.store.remove_entry(&file.resolved).await {
                Ok(Some(removed)) => {
                    remaining = remaining.saturating_sub(file.size);
                    report.deleted_files += 1;
                    report.deleted_bytes = report.deleted_bytes.saturating_add(removed);
                    tracing::debug!(target: LOG_TARGET, key = %key, bytes = removed, "evicted cache entry");
                }
                Ok(None) => {
                    // Removed by someone else since the scan.
                    remaining = remaining.saturating_sub(file.size);
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        target: LOG_TARGET,
                        key = %key,
                        error = %err,
                        "failed to evict cache entry"
                    );
                }
            }
        }

        report.usage_after = remaining;
        self.store
            .record_eviction(report.deleted_files as u64, report.deleted_bytes);
        self.store.record_usage(remaining);
        Ok(report)
    }

    /// Sweeps every `interval` until `cancel` fires, persisting the
    /// access-time index when it changed and `index_save_interval` elapsed
    /// (or a sweep deleted something).
    pub async fn run(
        &self,
        interval: Duration,
        index_save_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_save = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let evicted = match self.sweep_once().await {
                Ok(report) => {
                    if report.deleted_files > 0 || report.failed > 0 {
                        tracing::info!(
                            target: LOG_TARGET,
                            usage_before = report.usage_before,
                            usage_after = report.usage_after,
                            deleted_files = report.deleted_files,
                            deleted_bytes = report.deleted_bytes,
                            failed = report.failed,
                            total_cleaned = self.store.total_cleaned(),
                            "cache eviction sweep finished"
                        );
                    }
                    report.deleted_files > 0
                }
                Err(err) => {
                    tracing::warn!(target: LOG_TARGET, error = %err, "cache eviction sweep failed");
                    false
                }
            };

            let tracker = self.store.tracker();
            if tracker.is_dirty() && (evicted || last_save.elapsed() >= index_save_interval) {
                match self.store.save_access_times().await {
                    Ok(()) => last_save = Instant::now(),
                    Err(err) => tracing::warn!(
                        target: LOG_TARGET,
                        error = %err,
                        "failed to save access-time index"
                    ),
                }
            }
        }
    }

    async fn scan(&self) -> Result<Vec<ScannedFile>> {
        let guard = self.store.guard().clone();
        let files = tokio::task::spawn_blocking(move || scan_tree(&guard)).await?;
        Ok(files)
    }
}

fn total_size(files: &[ScannedFile]) -> u64 {
    files
        .iter()
        .fold(0u64, |acc, file| acc.saturating_add(file.size))
}

fn is_index_file(root: &Path, path: &Path) -> bool {
    path.parent() == Some(root)
        && path.file_name().is_some_and(|name| name == ACCESS_TIME_INDEX_FILENAME)
}

fn scan_tree(guard: &PathGuard) -> Vec<ScannedFile> {
    let root = guard.root();
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // Entries can race with deletion; only log unexpected errors.
                let missing = err
                    .io_error()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound);
                if !missing {
                    tracing::debug!(
                        target: LOG_TARGET,
                        path = ?err.path().map(|p| p.display().to_string()),
                        error = %err,
                        "failed to walk cache directory"
                    );
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if is_temp_file_name(&entry.file_name().to_string_lossy())
            || is_index_file(root, entry.path())
        {
            continue;
        }
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        let Ok(resolved) = guard.validate_scanned(entry.path()) else {
            continue;
        };
        files.push(ScannedFile { resolved, size });
    }
    files
}

/// Removes leftovers of an unclean shutdown: staging files, directories left
/// empty, and access-time entries whose files are gone.
///
/// Must run before any concurrent writer is started on the same root.
pub async fn clean_up_at_start(store: &CacheStore) -> Result<StartupCleanupReport> {
    let guard = store.guard().clone();
    let (mut report, live_keys) =
        tokio::task::spawn_blocking(move || clean_up_tree(&guard)).await?;

    report.dropped_index_entries = store.tracker().retain(|key| live_keys.contains(key));
    if report != StartupCleanupReport::default() {
        tracing::info!(
            target: LOG_TARGET,
            removed_temp_files = report.removed_temp_files,
            removed_dirs = report.removed_dirs,
            dropped_index_entries = report.dropped_index_entries,
            "cleaned up cache directory at startup"
        );
    }
    Ok(report)
}

fn clean_up_tree(guard: &PathGuard) -> (StartupCleanupReport, HashSet<String>) {
    let root = guard.root();
    let mut report = StartupCleanupReport::default();
    let mut live_keys = HashSet::new();

    for entry in walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .contents_first(true)
    {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();

        if entry.file_type().is_dir() {
            let empty = std::fs::read_dir(path)
                .map(|mut it| it.next().is_none())
                .unwrap_or(false);
            if empty && std::fs::remove_dir(path).is_ok() {
                report.removed_dirs += 1;
            }
            continue;
        }

        if is_temp_file_name(&entry.file_name().to_string_lossy()) {
            match std::fs::remove_file(path) {
                Ok(()) => report.removed_temp_files += 1,
                Err(err) => tracing::debug!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    error = %err,
                    "failed to remove orphaned staging file"
                ),
            }
            continue;
        }

        if is_index_file(root, path) {
            continue;
        }
        if let Ok(resolved) = guard.validate_scanned(path) {
            live_keys.insert(resolved.index_key());
        }
    }

    (report, live_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn ts(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    async fn store_with(files: &[(&str, usize, Option<u64>)]) -> (tempfile::TempDir, Arc<CacheStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(tmp.path()));
        for (key, size, at) in files {
            store.put_bytes(key, &vec![b'x'; *size]).await.unwrap();
            store.tracker().remove_timestamp(key);
            if let Some(at) = at {
                store.tracker().add_timestamp(key, ts(*at));
            }
        }
        (tmp, store)
    }

    #[tokio::test]
    async fn under_budget_is_a_no_op() {
        let (tmp, store) = store_with(&[("a", 10, Some(1)), ("b", 10, Some(2))]).await;
        let sweeper = EvictionSweeper::with_limits(store.clone(), 20, 20);

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.deleted_files, 0);
        assert_eq!(report.usage_before, 20);
        assert_eq!(store.total_cleaned(), 0);
        assert!(tmp.path().join("a").is_file());
        assert!(tmp.path().join("b").is_file());
    }

    #[tokio::test]
    async fn evicts_oldest_first_until_under_budget() {
        let (tmp, store) = store_with(&[
            ("new", 10, Some(300)),
            ("old", 10, Some(100)),
            ("mid", 10, Some(200)),
        ])
        .await;
        let sweeper = EvictionSweeper::with_limits(store.clone(), 15, 15);

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.deleted_files, 2);
        assert_eq!(report.deleted_bytes, 20);
        assert_eq!(report.usage_after, 10);
        assert_eq!(store.total_cleaned(), 20);
        assert!(!tmp.path().join("old").exists());
        assert!(!tmp.path().join("mid").exists());
        assert!(tmp.path().join("new").is_file());
        assert_eq!(store.stats().evicted_files, 2);
    }

    #[tokio::test]
    async fn unknown_access_times_go_first_and_ties_use_key_order() {
        let (tmp, store) = store_with(&[
            ("b", 10, Some(100)),
            ("a", 10, Some(100)),
            ("untracked", 10, None),
        ])
        .await;
        let sweeper = EvictionSweeper::with_limits(store.clone(), 25, 15);

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.deleted_files, 2);
        assert!(!tmp.path().join("untracked").exists());
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().join("b").is_file());
    }

    #[tokio::test]
    async fn low_water_mark_reclaims_below_budget() {
        let (_tmp, store) = store_with(&[
            ("a", 10, Some(1)),
            ("b", 10, Some(2)),
            ("c", 10, Some(3)),
            ("d", 10, Some(4)),
        ])
        .await;
        // Budget 35 is exceeded; sweep down to 20.
        let sweeper = EvictionSweeper::with_limits(store.clone(), 35, 20);

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.deleted_files, 2);
        assert_eq!(report.usage_after, 20);
    }

    #[tokio::test]
    async fn scan_ignores_temp_files_and_index() {
        let (tmp, store) = store_with(&[("t/seg", 10, Some(1))]).await;
        std::fs::write(tmp.path().join("t/seg.99.1.part"), vec![0u8; 1000]).unwrap();
        store.save_access_times().await.unwrap();

        let sweeper = EvictionSweeper::with_limits(store.clone(), 5, 5);
        assert_eq!(sweeper.measure_usage().await.unwrap(), 10);

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.deleted_bytes, 10);
        assert!(tmp.path().join("t/seg.99.1.part").is_file());
        assert!(tmp.path().join(ACCESS_TIME_INDEX_FILENAME).is_file());
    }

    #[tokio::test]
    async fn eviction_prunes_empty_directories() {
        let (tmp, store) = store_with(&[
            ("a/b/c/first_topic/file1.txt", 10, Some(1)),
            ("a/b/c/second_topic/file2.txt", 10, Some(2)),
        ])
        .await;
        let sweeper = EvictionSweeper::with_limits(store.clone(), 15, 15);

        sweeper.sweep_once().await.unwrap();
        assert!(!tmp.path().join("a/b/c/first_topic").exists());
        assert!(tmp.path().join("a/b/c/second_topic/file2.txt").is_file());
    }

    #[tokio::test]
    async fn startup_cleanup_removes_leftovers() {
        let (tmp, store) = store_with(&[("keep/seg", 4, Some(1))]).await;
        std::fs::create_dir_all(tmp.path().join("empty/nested")).unwrap();
        std::fs::create_dir_all(tmp.path().join("crashed")).unwrap();
        std::fs::write(tmp.path().join("crashed/seg.1.2.part"), b"partial").unwrap();
        store.tracker().add_timestamp("gone/seg", ts(5));

        let report = clean_up_at_start(&store).await.unwrap();
        assert_eq!(report.removed_temp_files, 1);
        assert_eq!(report.removed_dirs, 3);
        assert_eq!(report.dropped_index_entries, 1);
        assert!(!tmp.path().join("empty").exists());
        assert!(!tmp.path().join("crashed").exists());
        assert!(tmp.path().join("keep/seg").is_file());
        assert!(tmp.path().exists());
        assert!(store.tracker().estimate_timestamp("keep/seg").is_some());
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_saves_dirty_index() {
        let (tmp, store) = store_with(&[("a", 10, Some(1)), ("b", 10, Some(2))]).await;
        let sweeper = EvictionSweeper::with_limits(store.clone(), 15, 15);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                sweeper
                    .run(Duration::from_millis(20), Duration::from_secs(3600), cancel)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().join("b").is_file());
        // Eviction changed the index, so it was persisted.
        let reloaded = CacheStore::new(tmp.path());
        assert!(reloaded.load_access_times().await.unwrap());
        assert!(reloaded.tracker().estimate_timestamp("a").is_none());
        assert!(reloaded.tracker().estimate_timestamp("b").is_some());
    }
}
