use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

use crate::config::CacheConfig;
use crate::core::{CacheCore, ContentInfo, ProgressCallback};
use crate::error::{CacheError, Result};
use crate::eviction::{CustomOrdering, EvictionEngine, MemoryPressure};
use crate::loader::{LoaderOptions, PlayerRequest, RequestId};
use crate::metadata::{Priority, ResourceKey, ResourceMetadata};
use crate::origin::{HttpOrigin, Origin, RetryConfig};
use crate::preload::{PreloadCounters, PreloadScheduler, PreloadTask, TaskId};
use crate::registry::{ActiveKeys, LoaderRegistry};
use crate::stats::{CacheStats, StatsRecorder};

/// The assembled cache: player request routing, preload scheduling,
/// storage and eviction behind one handle.
///
/// Construction wires the components; [`MediaCache::init`] must run (and
/// complete startup reconciliation) before any other operation.
pub struct MediaCache {
    config: std::sync::RwLock<CacheConfig>,
    core: Arc<CacheCore>,
    registry: Arc<LoaderRegistry>,
    scheduler: Arc<PreloadScheduler>,
    eviction: Arc<EvictionEngine>,
    stats: Arc<StatsRecorder>,
    initialized: AtomicBool,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MediaCache {
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let dir = config
            .cache_directory()
            .map_err(|e| CacheError::Config(e.to_string()))?;
        let stats = Arc::new(StatsRecorder::new(
            dir.join("statistics.json"),
            Duration::from_secs(config.stats_flush_interval_secs),
        ));
        let core = Arc::new(CacheCore::new(&config, stats.clone())?);

        let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new(&config)?);
        let (hint_tx, hint_rx) = mpsc::unbounded_channel();
        let registry = LoaderRegistry::new(
            core.clone(),
            origin,
            LoaderOptions {
                chunk_size: config.player_chunk_size,
                retry: RetryConfig::default(),
                segment_sink: Some(hint_tx),
            },
        );

        let active: Arc<dyn ActiveKeys> = registry.clone();
        let eviction = EvictionEngine::new(core.clone(), active, &config);
        core.set_eviction(Arc::downgrade(&eviction));

        let scheduler =
            PreloadScheduler::new(config.clone(), core.clone(), registry.clone(), stats.clone());
        let hint_pump = scheduler.spawn_hint_pump(hint_rx);

        Ok(Arc::new(Self {
            config: std::sync::RwLock::new(config),
            core,
            registry,
            scheduler,
            eviction,
            stats,
            initialized: AtomicBool::new(false),
            background: std::sync::Mutex::new(vec![hint_pump]),
        }))
    }

    /// Startup reconciliation plus background timers. Idempotent.
    pub async fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.core.load_all().await?;
        let timers = self.eviction.spawn_timers();
        if let Ok(mut background) = self.background.lock() {
            background.extend(timers);
        }
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "Cache initialized: {} bytes cached",
            self.core.current_size().await
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }

    fn config(&self) -> CacheConfig {
        self.config
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Player-facing custom-scheme URL for an origin URL.
    pub fn cache_url(&self, original: &Url) -> Result<Url> {
        self.config().cache_url(original)
    }

    /// Origin URL for a player-facing custom-scheme URL.
    pub fn original_url(&self, cache: &Url) -> Result<Url> {
        self.config().original_url(cache)
    }

    pub fn resource_key(&self, original: &Url) -> ResourceKey {
        self.config().resource_key(original)
    }

    /// Route a player loading request. The URL may carry the cache scheme
    /// prefix or be the plain origin URL.
    pub async fn handle_request(&self, url: &Url, request: PlayerRequest) -> Result<()> {
        self.ensure_initialized()?;
        let config = self.config();
        let original = config.original_url(url).unwrap_or_else(|_| url.clone());
        let key = config.resource_key(&original);
        self.registry
            .handle_player_request(&original, &key, request)
            .await
    }

    /// Detach a player request; the loader goes away when nothing else is
    /// attached to its key.
    pub fn cancel_request(&self, url: &Url, id: RequestId) -> Result<()> {
        self.ensure_initialized()?;
        let config = self.config();
        let original = config.original_url(url).unwrap_or_else(|_| url.clone());
        let key = config.resource_key(&original);
        self.registry.handle_player_cancel(&key, id);
        Ok(())
    }

    /// Queue a preload of the first `length` bytes of `url`.
    pub async fn preload(&self, url: Url, length: i64, priority: Priority) -> Result<TaskId> {
        self.ensure_initialized()?;
        if length <= 0 {
            return Err(CacheError::Config("preload length must be positive".into()));
        }
        Ok(self.scheduler.add(url, length, priority).await)
    }

    /// Queue a whole-resource preload.
    pub async fn preload_all(&self, url: Url, priority: Priority) -> Result<TaskId> {
        self.ensure_initialized()?;
        Ok(self
            .scheduler
            .add(url, crate::preload::WHOLE_RESOURCE, priority)
            .await)
    }

    pub async fn cancel_preload(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id).await
    }

    pub async fn pause_preload(&self, id: TaskId) -> bool {
        self.scheduler.pause(id).await
    }

    pub async fn resume_preload(&self, id: TaskId) -> bool {
        self.scheduler.resume(id).await
    }

    pub async fn cancel_all_preloads(&self) {
        self.scheduler.cancel_all().await;
    }

    pub async fn pause_all_preloads(&self) {
        self.scheduler.pause_all().await;
    }

    pub async fn resume_all_preloads(&self) {
        self.scheduler.resume_all().await;
    }

    pub async fn preload_status(&self, id: TaskId) -> Option<PreloadTask> {
        self.scheduler.status(id).await
    }

    pub async fn preload_counters(&self) -> PreloadCounters {
        self.scheduler.counters().await
    }

    /// Drop a resource: cancels its loader and deletes file and metadata.
    pub async fn remove(&self, url: &Url) -> Result<()> {
        self.ensure_initialized()?;
        let key = self.resource_key(url);
        self.registry.cancel_key(&key);
        self.core.remove(&key).await
    }

    /// Drop everything, cancelling all loaders and preload tasks.
    pub async fn clear_all(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.scheduler.cancel_all().await;
        self.registry.cancel_all();
        self.core.clear_all().await
    }

    pub async fn content_info(&self, url: &Url) -> Result<Option<ContentInfo>> {
        self.ensure_initialized()?;
        Ok(self.core.content_info(&self.resource_key(url)).await)
    }

    pub async fn metadata(&self, url: &Url) -> Result<Option<ResourceMetadata>> {
        self.ensure_initialized()?;
        Ok(self.core.get_metadata(&self.resource_key(url)).await)
    }

    pub async fn set_priority(&self, url: &Url, priority: Priority) -> Result<()> {
        self.ensure_initialized()?;
        self.core
            .set_priority(&self.resource_key(url), priority)
            .await
    }

    pub async fn set_expires_at(
        &self,
        url: &Url,
        deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        self.core
            .set_expires_at(&self.resource_key(url), deadline)
            .await
    }

    pub async fn current_cache_size(&self) -> i64 {
        self.core.current_size().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        self.core.set_progress_callback(callback);
    }

    /// Forward a host memory-pressure notification to the eviction engine.
    pub async fn handle_memory_pressure(&self, level: MemoryPressure) {
        self.eviction.handle_memory_pressure(level).await;
    }

    pub fn register_eviction_strategy(&self, name: impl Into<String>, ordering: CustomOrdering) {
        self.eviction.register_custom_strategy(name, ordering);
    }

    /// Apply a new configuration in one step. Only runtime tunables take
    /// effect (byte budget, cleanup strategy, expiration default); storage
    /// paths and extensions require a new instance.
    pub async fn reconfigure(&self, config: CacheConfig) -> Result<()> {
        config.validate()?;
        self.eviction.set_budget(config.max_cache_size_bytes);
        self.eviction.set_strategy(config.cleanup_strategy.clone());
        if let Ok(mut guard) = self.config.write() {
            *guard = config;
        }
        Ok(())
    }

    /// Cancel all activity and flush durable state.
    pub async fn shutdown(&self) {
        self.scheduler.cancel_all().await;
        self.registry.cancel_all();
        if let Ok(mut background) = self.background.lock() {
            for handle in background.drain(..) {
                handle.abort();
            }
        }
        self.stats.flush();
        info!("Cache shut down");
    }
}
