use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Point-in-time snapshot of the aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub evictions: u64,
    pub preloads_completed: u64,
    pub preloads_failed: u64,
    pub preloads_cancelled: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Process-wide counters with best-effort debounced persistence.
///
/// Counters are advisory: they are flushed to `statistics.json` at most
/// once per interval and never fsynced, so a crash may lose recent updates.
#[derive(Debug)]
pub struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    evictions: AtomicU64,
    preloads_completed: AtomicU64,
    preloads_failed: AtomicU64,
    preloads_cancelled: AtomicU64,
    path: PathBuf,
    flush_interval: Duration,
    last_flush: Mutex<Instant>,
}

impl StatsRecorder {
    pub fn new(path: PathBuf, flush_interval: Duration) -> Self {
        let seed = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<CacheStats>(&bytes).ok())
            .unwrap_or_default();

        Self {
            hits: AtomicU64::new(seed.hits),
            misses: AtomicU64::new(seed.misses),
            bytes_read: AtomicU64::new(seed.bytes_read),
            bytes_written: AtomicU64::new(seed.bytes_written),
            evictions: AtomicU64::new(seed.evictions),
            preloads_completed: AtomicU64::new(seed.preloads_completed),
            preloads_failed: AtomicU64::new(seed.preloads_failed),
            preloads_cancelled: AtomicU64::new(seed.preloads_cancelled),
            path,
            flush_interval,
            last_flush: Mutex::new(Instant::now()),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_completed(&self) {
        self.preloads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_failed(&self) {
        self.preloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preload_cancelled(&self) {
        self.preloads_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            preloads_completed: self.preloads_completed.load(Ordering::Relaxed),
            preloads_failed: self.preloads_failed.load(Ordering::Relaxed),
            preloads_cancelled: self.preloads_cancelled.load(Ordering::Relaxed),
        }
    }

    /// Persist the counters if the debounce window has elapsed.
    pub fn maybe_flush(&self) {
        {
            let mut last = match self.last_flush.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if last.elapsed() < self.flush_interval {
                return;
            }
            *last = Instant::now();
        }
        self.flush();
    }

    /// Persist the counters unconditionally; failures are logged only.
    pub fn flush(&self) {
        let snapshot = self.snapshot();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    debug!("Failed to persist statistics to {}: {e}", self.path.display());
                }
            }
            Err(e) => debug!("Failed to encode statistics: {e}"),
        }
    }
}
