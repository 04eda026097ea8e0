use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::eviction::EvictionEngine;
use crate::file_slot::FileSlot;
use crate::metadata::{MetadataStore, Priority, ResourceKey, ResourceMetadata};
use crate::origin::ResponseMeta;
use crate::range_set::ByteRange;
use crate::stats::StatsRecorder;

/// Content description served to the player's content-info sub-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub content_type: Option<String>,
    pub total_length: Option<i64>,
    pub supports_range: bool,
}

/// Write-progress notification, emitted once the total length is known.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub key: ResourceKey,
    pub url: String,
    pub percent: f64,
    pub cached_bytes: i64,
    pub total_length: i64,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

// Progress is rate limited to one call per 100 ms or per 0.5 % change,
// whichever comes sooner.
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);
const PROGRESS_MIN_DELTA_PERCENT: f64 = 0.5;

struct PendingChunk {
    offset: i64,
    data: Vec<u8>,
}

struct BatchBuffer {
    chunks: Vec<PendingChunk>,
    last_flush: Instant,
}

impl BatchBuffer {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            last_flush: Instant::now(),
        }
    }
}

struct CoreState {
    metadata: MetadataStore,
    slots: HashMap<ResourceKey, Arc<FileSlot>>,
    batches: HashMap<ResourceKey, BatchBuffer>,
    current_size: i64,
    progress_marks: HashMap<ResourceKey, (Instant, f64)>,
}

/// Single point of coordination for cache storage.
///
/// All metadata mutation and `current_size` accounting happens inside one
/// serialization domain (the state mutex); disk I/O for different keys
/// still proceeds through per-key file slots.
pub struct CacheCore {
    data_dir: PathBuf,
    data_extension: String,
    flush_interval: Duration,
    default_expiration: Option<chrono::Duration>,
    state: Mutex<CoreState>,
    stats: Arc<StatsRecorder>,
    progress: std::sync::RwLock<Option<ProgressCallback>>,
    eviction: OnceLock<Weak<EvictionEngine>>,
}

impl CacheCore {
    pub fn new(config: &CacheConfig, stats: Arc<StatsRecorder>) -> Result<Self> {
        let data_dir = config
            .cache_directory()
            .map_err(|e| CacheError::Config(e.to_string()))?;
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| CacheError::Io(format!("failed to create {}: {e}", data_dir.display())))?;

        let metadata = MetadataStore::new(
            data_dir.join("Metadata"),
            config.metadata_file_extension.clone(),
        )?;

        Ok(Self {
            data_dir,
            data_extension: config.cache_file_extension.clone(),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            default_expiration: config
                .default_expiration_interval_secs
                .map(|secs| chrono::Duration::seconds(secs as i64)),
            state: Mutex::new(CoreState {
                metadata,
                slots: HashMap::new(),
                batches: HashMap::new(),
                current_size: 0,
                progress_marks: HashMap::new(),
            }),
            stats,
            progress: std::sync::RwLock::new(None),
            eviction: OnceLock::new(),
        })
    }

    /// Wire the eviction engine in after construction. One-way capability:
    /// the engine owns a strong reference to the core, never the reverse.
    pub fn set_eviction(&self, engine: Weak<EvictionEngine>) {
        let _ = self.eviction.set(engine);
    }

    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        if let Ok(mut guard) = self.progress.write() {
            *guard = callback;
        }
    }

    pub fn data_path(&self, key: &ResourceKey) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", key, self.data_extension))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Startup reconciliation: load every metadata record and reconcile it
    /// with the data files on disk.
    pub async fn load_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let data_dir = self.data_dir.clone();
        let ext = self.data_extension.clone();
        state.current_size = state.metadata.load_all(&data_dir, &ext)?;
        Ok(())
    }

    /// Create metadata for a key if none exists yet.
    pub async fn ensure_metadata(
        &self,
        key: &ResourceKey,
        url: &str,
        priority: Priority,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.metadata.contains(key) {
            return Ok(());
        }
        let mut metadata = ResourceMetadata::new(key.clone(), url);
        metadata.priority = priority;
        if let Some(interval) = self.default_expiration {
            metadata.expires_at = Some(chrono::Utc::now() + interval);
        }
        state.metadata.put(metadata)?;
        Ok(())
    }

    /// Read a fully cached range. Returns `None` on a miss, including when
    /// the range is only partially cached; composing partial reads with
    /// network fills is the loader's job.
    pub async fn read(&self, key: &ResourceKey, range: ByteRange) -> Result<Option<Vec<u8>>> {
        let (data, flushed_delta) = {
            let mut state = self.state.lock().await;

            // A read that happens-after a successful write must observe
            // the written bytes: the pending batch is committed before the
            // coverage check so buffered chunks count as cached.
            let flushed_delta = self.flush_locked(&mut state, key).await?;
            if flushed_delta > 0 {
                self.emit_progress_locked(&mut state, key);
            }

            let covered = state
                .metadata
                .get(key)
                .is_some_and(|m| m.ranges.contains(&range));
            let data = if !covered {
                self.stats.record_miss();
                None
            } else {
                let slot = self.slot_locked(&mut state, key).await?;
                let data = slot.read_at(range.start, range.len() as usize).await?;
                if data.len() as i64 != range.len() {
                    warn!(
                        "Short read for {key} at {}..={}: got {} bytes",
                        range.start,
                        range.end,
                        data.len()
                    );
                    self.stats.record_miss();
                    None
                } else {
                    if let Some(m) = state.metadata.get_mut(key) {
                        m.mark_accessed();
                    }
                    state.metadata.persist(key)?;
                    self.stats.record_hit();
                    self.stats.add_bytes_read(data.len() as u64);
                    self.stats.maybe_flush();
                    Some(data)
                }
            };
            (data, flushed_delta)
        };

        if flushed_delta > 0 {
            self.kick_eviction().await;
        }
        Ok(data)
    }

    /// Buffer a write for `key`. Chunks are coalesced per key and flushed
    /// once the flush window elapses; the range set and size accounting are
    /// updated only when a chunk actually reaches the file.
    pub async fn write(&self, key: &ResourceKey, offset: i64, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Err(CacheError::Config("zero-length write rejected".into()));
        }
        if offset < 0 {
            return Err(CacheError::Config(format!("negative write offset {offset}")));
        }

        let flushed_delta;
        {
            let mut state = self.state.lock().await;

            let metadata = state
                .metadata
                .get(key)
                .ok_or_else(|| CacheError::NotFound(format!("no metadata for {key}")))?;
            if let Some(total) = metadata.total_length {
                if offset + data.len() as i64 > total {
                    return Err(CacheError::Config(format!(
                        "write [{offset}, {}) beyond total length {total}",
                        offset + data.len() as i64
                    )));
                }
            }

            let batch = state.batches.entry(key.clone()).or_insert_with(BatchBuffer::new);
            batch.chunks.push(PendingChunk { offset, data });

            if batch.last_flush.elapsed() >= self.flush_interval {
                flushed_delta = self.flush_locked(&mut state, key).await?;
            } else {
                flushed_delta = 0;
            }

            if flushed_delta > 0 {
                self.emit_progress_locked(&mut state, key);
            }
        }

        if flushed_delta > 0 {
            self.kick_eviction().await;
        }
        Ok(())
    }

    /// Commit any pending chunks for `key` to disk.
    pub async fn flush(&self, key: &ResourceKey) -> Result<()> {
        let delta = {
            let mut state = self.state.lock().await;
            let delta = self.flush_locked(&mut state, key).await?;
            if delta > 0 {
                self.emit_progress_locked(&mut state, key);
            }
            delta
        };
        if delta > 0 {
            self.kick_eviction().await;
        }
        Ok(())
    }

    // Applies the pending batch in enqueue order. Ranges are claimed only
    // for chunks the file accepted; a failed chunk drops the remainder of
    // the batch and surfaces the error.
    async fn flush_locked(&self, state: &mut CoreState, key: &ResourceKey) -> Result<i64> {
        let Some(mut batch) = state.batches.remove(key) else {
            return Ok(0);
        };
        if batch.chunks.is_empty() {
            return Ok(0);
        }

        let slot = self.slot_locked(state, key).await?;
        let mut delta = 0i64;
        let mut written = 0u64;
        let mut failure = None;

        for chunk in batch.chunks.drain(..) {
            match slot.write_at(chunk.offset, &chunk.data).await {
                Ok(()) => {
                    written += chunk.data.len() as u64;
                    if let Some(range) = ByteRange::from_len(chunk.offset, chunk.data.len() as i64)
                    {
                        if let Some(m) = state.metadata.get_mut(key) {
                            delta += m.add_range(range);
                        }
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        state.current_size += delta;
        if delta > 0 || failure.is_some() {
            state.metadata.persist(key)?;
        }
        self.stats.add_bytes_written(written);
        self.stats.maybe_flush();

        match failure {
            Some(e) => {
                warn!("Batch flush for {key} failed: {e}");
                Err(e)
            }
            None => Ok(delta),
        }
    }

    async fn slot_locked(
        &self,
        state: &mut CoreState,
        key: &ResourceKey,
    ) -> Result<Arc<FileSlot>> {
        if let Some(slot) = state.slots.get(key) {
            return Ok(slot.clone());
        }
        let slot = Arc::new(FileSlot::open(self.data_path(key)).await?);
        state.slots.insert(key.clone(), slot.clone());
        Ok(slot)
    }

    fn emit_progress_locked(&self, state: &mut CoreState, key: &ResourceKey) {
        let Some(callback) = self.progress.read().ok().and_then(|g| g.clone()) else {
            return;
        };
        let Some(m) = state.metadata.get(key) else {
            return;
        };
        let Some(total) = m.total_length.filter(|t| *t > 0) else {
            return;
        };

        let cached_bytes = m.cached_bytes;
        let url = m.original_url.clone();
        let percent = cached_bytes as f64 / total as f64 * 100.0;

        let now = Instant::now();
        if let Some((last_at, last_percent)) = state.progress_marks.get(key) {
            if now.duration_since(*last_at) < PROGRESS_MIN_INTERVAL
                && (percent - last_percent).abs() < PROGRESS_MIN_DELTA_PERCENT
            {
                return;
            }
        }
        state.progress_marks.insert(key.clone(), (now, percent));

        callback(ProgressUpdate {
            key: key.clone(),
            url,
            percent,
            cached_bytes,
            total_length: total,
        });
    }

    async fn kick_eviction(&self) {
        if let Some(engine) = self.eviction.get().and_then(Weak::upgrade) {
            Box::pin(engine.check()).await;
        }
    }

    /// Flush, fsync, and verify the resource before recording completion.
    ///
    /// Verification compares the on-disk file size against `expected_size`
    /// (or the sum of cached intervals when absent). On mismatch the entry
    /// stays incomplete and the partial cache is kept.
    pub async fn mark_complete(&self, key: &ResourceKey, expected_size: Option<i64>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state, key).await?;

        let slot = self.slot_locked(&mut state, key).await?;
        slot.sync().await?;
        let actual = slot.file_size().await?;

        let metadata = state
            .metadata
            .get_mut(key)
            .ok_or_else(|| CacheError::NotFound(format!("no metadata for {key}")))?;
        let expected = expected_size.unwrap_or_else(|| metadata.ranges.total_len());

        if actual != expected {
            metadata.is_complete = false;
            state.metadata.persist(key)?;
            return Err(CacheError::Integrity { expected, actual });
        }

        if metadata.total_length.is_none() {
            metadata.total_length = Some(actual);
        }
        if !metadata.covers_all() {
            metadata.is_complete = false;
            let cached = metadata.ranges.total_len();
            state.metadata.persist(key)?;
            return Err(CacheError::Integrity {
                expected,
                actual: cached,
            });
        }

        metadata.is_complete = true;
        metadata.touch();
        state.metadata.persist(key)?;
        info!("Resource {key} complete ({actual} bytes)");
        Ok(())
    }

    /// Drop the entry: pending batch, file slot, data file, metadata record.
    pub async fn remove(&self, key: &ResourceKey) -> Result<()> {
        let mut state = self.state.lock().await;

        state.batches.remove(key);
        state.progress_marks.remove(key);
        if let Some(slot) = state.slots.remove(key) {
            if let Err(e) = slot.close().await {
                debug!("Closing slot for {key} during remove: {e}");
            }
        }

        let path = self.data_path(key);
        match tokio_fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::Io(format!(
                    "failed to delete {}: {e}",
                    path.display()
                )));
            }
        }

        if let Some(removed) = state.metadata.remove(key) {
            state.current_size -= removed.cached_bytes;
            debug!(
                "Removed {key}: freed {} bytes, cache now {} bytes",
                removed.cached_bytes, state.current_size
            );
        }
        Ok(())
    }

    /// Remove every entry.
    pub async fn clear_all(&self) -> Result<()> {
        let keys: Vec<ResourceKey> = {
            let state = self.state.lock().await;
            state.metadata.keys().cloned().collect()
        };
        for key in keys {
            self.remove(&key).await?;
        }
        Ok(())
    }

    pub async fn get_metadata(&self, key: &ResourceKey) -> Option<ResourceMetadata> {
        self.state.lock().await.metadata.get(key).cloned()
    }

    pub async fn content_info(&self, key: &ResourceKey) -> Option<ContentInfo> {
        let state = self.state.lock().await;
        state.metadata.get(key).map(|m| ContentInfo {
            content_type: m.content_type.clone(),
            total_length: m.total_length,
            supports_range: m.supports_range,
        })
    }

    /// Record headers learned from the first successful origin response.
    /// Fields already learned are left untouched.
    pub async fn update_content_info(&self, key: &ResourceKey, meta: &ResponseMeta) -> Result<()> {
        let mut state = self.state.lock().await;
        let m = state
            .metadata
            .get_mut(key)
            .ok_or_else(|| CacheError::NotFound(format!("no metadata for {key}")))?;

        if m.content_type.is_none() {
            m.content_type = meta.content_type.clone();
        }
        if m.total_length.is_none() {
            m.total_length = meta.total_length;
        }
        m.supports_range = m.supports_range || meta.supports_range;
        m.touch();
        state.metadata.persist(key)?;
        Ok(())
    }

    pub async fn set_priority(&self, key: &ResourceKey, priority: Priority) -> Result<()> {
        let mut state = self.state.lock().await;
        let m = state
            .metadata
            .get_mut(key)
            .ok_or_else(|| CacheError::NotFound(format!("no metadata for {key}")))?;
        m.priority = priority;
        m.touch();
        state.metadata.persist(key)?;
        Ok(())
    }

    pub async fn set_expires_at(
        &self,
        key: &ResourceKey,
        deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let m = state
            .metadata
            .get_mut(key)
            .ok_or_else(|| CacheError::NotFound(format!("no metadata for {key}")))?;
        m.expires_at = deadline;
        m.touch();
        state.metadata.persist(key)?;
        Ok(())
    }

    /// First missing offset at or after `from`, for resuming fetches.
    pub async fn next_missing_offset(&self, key: &ResourceKey, from: i64) -> i64 {
        let state = self.state.lock().await;
        state
            .metadata
            .get(key)
            .map(|m| m.ranges.next_gap(from))
            .unwrap_or(from)
    }

    pub async fn current_size(&self) -> i64 {
        self.state.lock().await.current_size
    }

    /// Snapshot of every entry, for eviction candidate selection.
    pub async fn snapshot_entries(&self) -> Vec<ResourceMetadata> {
        let state = self.state.lock().await;
        state.metadata.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Whether a batch flush is pending for `key`.
    pub async fn has_pending_writes(&self, key: &ResourceKey) -> bool {
        let state = self.state.lock().await;
        state
            .batches
            .get(key)
            .is_some_and(|batch| !batch.chunks.is_empty())
    }

    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            cache_directory: Some(dir.path().to_path_buf()),
            // Immediate flushes keep these tests deterministic.
            flush_interval_ms: 0,
            ..Default::default()
        }
    }

    fn test_core(dir: &TempDir) -> CacheCore {
        let config = test_config(dir);
        let stats = Arc::new(StatsRecorder::new(
            dir.path().join("statistics.json"),
            Duration::from_secs(3600),
        ));
        CacheCore::new(&config, stats).unwrap()
    }

    fn key(n: u8) -> ResourceKey {
        ResourceKey::from(format!("{:064x}", n))
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(1);
        core.ensure_metadata(&k, "http://test/a", Priority::Normal)
            .await
            .unwrap();

        core.write(&k, 0, b"hello world".to_vec()).await.unwrap();
        let data = core
            .read(&k, ByteRange::try_new(0, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(data.as_deref(), Some(b"hello world".as_slice()));
    }

    #[tokio::test]
    async fn test_read_observes_buffered_write() {
        let dir = TempDir::new().unwrap();
        // A wide flush window keeps the write in the batch buffer, so the
        // read must commit it before the coverage check.
        let config = CacheConfig {
            cache_directory: Some(dir.path().to_path_buf()),
            flush_interval_ms: 60_000,
            ..Default::default()
        };
        let stats = Arc::new(StatsRecorder::new(
            dir.path().join("statistics.json"),
            Duration::from_secs(3600),
        ));
        let core = CacheCore::new(&config, stats).unwrap();
        let k = key(11);
        core.ensure_metadata(&k, "http://test/k", Priority::Normal)
            .await
            .unwrap();

        core.write(&k, 0, b"buffered".to_vec()).await.unwrap();
        assert!(core.has_pending_writes(&k).await);

        let data = core
            .read(&k, ByteRange::try_new(0, 7).unwrap())
            .await
            .unwrap();
        assert_eq!(data.as_deref(), Some(b"buffered".as_slice()));

        let m = core.get_metadata(&k).await.unwrap();
        assert_eq!(m.cached_bytes, 8);
        assert_eq!(core.current_size().await, 8);
        assert!(!core.has_pending_writes(&k).await);
    }

    #[tokio::test]
    async fn test_read_miss_without_metadata() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let data = core
            .read(&key(9), ByteRange::try_new(0, 10).unwrap())
            .await
            .unwrap();
        assert!(data.is_none());
        assert_eq!(core.stats().snapshot().misses, 1);
    }

    #[tokio::test]
    async fn test_partial_overlap_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(2);
        core.ensure_metadata(&k, "http://test/b", Priority::Normal)
            .await
            .unwrap();
        core.write(&k, 0, vec![1u8; 100]).await.unwrap();

        let miss = core
            .read(&k, ByteRange::try_new(50, 150).unwrap())
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_overlap_accounting_is_exact() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(3);
        core.ensure_metadata(&k, "http://test/c", Priority::Normal)
            .await
            .unwrap();

        core.write(&k, 100, vec![1u8; 200]).await.unwrap();
        core.write(&k, 200, vec![2u8; 200]).await.unwrap();

        let m = core.get_metadata(&k).await.unwrap();
        assert_eq!(
            m.ranges.as_slice(),
            &[ByteRange::try_new(100, 399).unwrap()]
        );
        assert_eq!(m.cached_bytes, 300);
        assert_eq!(core.current_size().await, 300);
    }

    #[tokio::test]
    async fn test_write_beyond_total_rejected() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(4);
        core.ensure_metadata(&k, "http://test/d", Priority::Normal)
            .await
            .unwrap();
        core.update_content_info(
            &k,
            &ResponseMeta {
                content_type: None,
                total_length: Some(100),
                supports_range: true,
                body_offset: 0,
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            core.write(&k, 90, vec![0u8; 20]).await,
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            core.write(&k, -1, vec![0u8; 1]).await,
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            core.write(&k, 0, Vec::new()).await,
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_complete_success() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(5);
        core.ensure_metadata(&k, "http://test/e", Priority::Normal)
            .await
            .unwrap();
        core.update_content_info(
            &k,
            &ResponseMeta {
                content_type: Some("video/mp4".into()),
                total_length: Some(256),
                supports_range: true,
                body_offset: 0,
            },
        )
        .await
        .unwrap();

        core.write(&k, 0, vec![7u8; 256]).await.unwrap();
        core.mark_complete(&k, Some(256)).await.unwrap();

        let m = core.get_metadata(&k).await.unwrap();
        assert!(m.is_complete);
    }

    #[tokio::test]
    async fn test_mark_complete_integrity_failure_keeps_partial() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(6);
        core.ensure_metadata(&k, "http://test/f", Priority::Normal)
            .await
            .unwrap();
        core.write(&k, 0, vec![7u8; 100]).await.unwrap();

        let err = core.mark_complete(&k, Some(256)).await.unwrap_err();
        assert!(matches!(err, CacheError::Integrity { expected: 256, actual: 100 }));

        let m = core.get_metadata(&k).await.unwrap();
        assert!(!m.is_complete);
        assert_eq!(m.cached_bytes, 100);
    }

    #[tokio::test]
    async fn test_remove_deletes_file_and_metadata() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(7);
        core.ensure_metadata(&k, "http://test/g", Priority::Normal)
            .await
            .unwrap();
        core.write(&k, 0, vec![1u8; 500]).await.unwrap();
        assert_eq!(core.current_size().await, 500);

        core.remove(&k).await.unwrap();
        assert_eq!(core.current_size().await, 0);
        assert!(core.get_metadata(&k).await.is_none());
        assert!(!core.data_path(&k).exists());
    }

    #[tokio::test]
    async fn test_read_hit_updates_access_stats() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(8);
        core.ensure_metadata(&k, "http://test/h", Priority::Normal)
            .await
            .unwrap();
        core.write(&k, 0, vec![1u8; 100]).await.unwrap();

        let before = core.get_metadata(&k).await.unwrap();
        assert_eq!(before.access_count, 0);

        core.read(&k, ByteRange::try_new(10, 20).unwrap())
            .await
            .unwrap()
            .unwrap();

        let after = core.get_metadata(&k).await.unwrap();
        assert_eq!(after.access_count, 1);
        assert!(after.last_access >= before.last_access);
        assert_eq!(core.stats().snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_progress_callback_fires_with_known_total() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let k = key(10);
        core.ensure_metadata(&k, "http://test/j", Priority::Normal)
            .await
            .unwrap();
        core.update_content_info(
            &k,
            &ResponseMeta {
                content_type: None,
                total_length: Some(1000),
                supports_range: true,
                body_offset: 0,
            },
        )
        .await
        .unwrap();

        let updates: Arc<std::sync::Mutex<Vec<ProgressUpdate>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = updates.clone();
        core.set_progress_callback(Some(Arc::new(move |u| {
            sink.lock().unwrap().push(u);
        })));

        core.write(&k, 0, vec![1u8; 500]).await.unwrap();

        let seen = updates.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].cached_bytes, 500);
        assert_eq!(seen[0].total_length, 1000);
        assert!((seen[0].percent - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        for n in 0..3 {
            let k = key(20 + n);
            core.ensure_metadata(&k, "http://test/x", Priority::Normal)
                .await
                .unwrap();
            core.write(&k, 0, vec![n; 100]).await.unwrap();
        }
        assert_eq!(core.current_size().await, 300);

        core.clear_all().await.unwrap();
        assert_eq!(core.current_size().await, 0);
        assert!(core.snapshot_entries().await.is_empty());
    }
}
