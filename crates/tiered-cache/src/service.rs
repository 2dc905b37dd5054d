use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::store::{CacheElementStatus, CacheItem, CacheStats, CacheStore};
use crate::sweeper::{clean_up_at_start, EvictionSweeper, SweepReport};
use crate::LOG_TARGET;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running cache: the store plus its background eviction task.
///
/// Must be started from within a tokio runtime. Call [`CacheService::stop`]
/// for an orderly shutdown that persists the access-time index; dropping the
/// service only cancels the background task.
#[derive(Debug)]
pub struct CacheService {
    config: CacheConfig,
    store: Arc<CacheStore>,
    sweeper: EvictionSweeper,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CacheService {
    pub async fn start(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.cache_dir).await?;

        let store = Arc::new(CacheStore::new(config.cache_dir.clone()));
        store.load_access_times().await?;
        clean_up_at_start(&store).await?;

        let sweeper = EvictionSweeper::new(store.clone(), &config);
        let usage = sweeper.measure_usage().await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let sweeper = sweeper.clone();
            let cancel = cancel.clone();
            let interval = config.check_interval();
            let save_interval = config.index_save_interval();
            async move { sweeper.run(interval, save_interval, cancel).await }
        });

        tracing::info!(
            target: LOG_TARGET,
            cache_dir = %config.cache_dir.display(),
            max_cache_size = config.max_cache_size.0,
            usage,
            tracked_keys = store.tracker().len(),
            "started cache service"
        );

        Ok(Self {
            config,
            store,
            sweeper,
            cancel,
            task: Some(task),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub async fn put<R>(&self, key: impl AsRef<Path>, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.store.put(key, reader).await
    }

    pub async fn put_bytes(&self, key: impl AsRef<Path>, bytes: &[u8]) -> Result<u64> {
        self.store.put_bytes(key, bytes).await
    }

    pub async fn get(&self, key: impl AsRef<Path>) -> Result<Option<CacheItem>> {
        self.store.get(key).await
    }

    pub async fn is_cached(&self, key: impl AsRef<Path>) -> Result<CacheElementStatus> {
        self.store.is_cached(key).await
    }

    pub async fn invalidate(&self, key: impl AsRef<Path>) -> Result<()> {
        self.store.invalidate(key).await
    }

    /// Runs an eviction pass immediately instead of waiting for the next tick.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweeper.sweep_once().await
    }

    pub fn total_cleaned(&self) -> u64 {
        self.store.total_cleaned()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Stops the background task and persists the access-time index.
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|err| CacheError::Runtime {
                message: format!("eviction task failed: {err}"),
            })?;
        }

        self.store.save_access_times().await?;
        tracing::info!(
            target: LOG_TARGET,
            cache_dir = %self.config.cache_dir.display(),
            total_cleaned = self.store.total_cleaned(),
            "stopped cache service"
        );
        Ok(())
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let err = CacheService::start(CacheConfig::new(tmp.path(), 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Config { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn start_creates_missing_cache_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested/cache");
        let service = CacheService::start(
            CacheConfig::new(&root, 1024).with_check_interval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
        assert!(root.is_dir());
        service.stop().await.unwrap();
        assert!(root.join(crate::ACCESS_TIME_INDEX_FILENAME).is_file());
    }

    #[tokio::test]
    async fn sweep_now_uses_configured_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let service = CacheService::start(
            CacheConfig::new(tmp.path(), 10).with_check_interval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();

        service.put_bytes("a", &[0u8; 8]).await.unwrap();
        service.put_bytes("b", &[0u8; 8]).await.unwrap();
        service.store().tracker().add_timestamp(
            "b",
            std::time::SystemTime::now() + Duration::from_secs(60),
        );

        let report = service.sweep_now().await.unwrap();
        assert_eq!(report.deleted_files, 1);
        assert_eq!(service.total_cleaned(), 8);
        assert_eq!(
            service.is_cached("a").await.unwrap(),
            CacheElementStatus::NotAvailable
        );
        assert_eq!(
            service.is_cached("b").await.unwrap(),
            CacheElementStatus::Available
        );
        service.stop().await.unwrap();
    }
}
