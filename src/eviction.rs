use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::core::CacheCore;
use crate::metadata::{Priority, ResourceMetadata};
use crate::registry::ActiveKeys;

/// Ordering applied when the byte budget or disk floor is exceeded.
/// `Custom` names an ordering registered at runtime; the string key is
/// stable so persisted configuration survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStrategy {
    Lru,
    Lfu,
    Fifo,
    ExpiredOnly,
    Priority,
    Custom(String),
}

/// Host-reported memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

pub type CustomOrdering =
    Arc<dyn Fn(&ResourceMetadata, &ResourceMetadata) -> Ordering + Send + Sync>;

/// Enforces the global byte budget and the disk-space floor.
///
/// A pass never rescans: candidates are ordered once and removed until the
/// budget and floor are met or the list is exhausted. Permanent and active
/// entries are never candidates.
pub struct EvictionEngine {
    core: Arc<CacheCore>,
    active: Arc<dyn ActiveKeys>,
    budget: std::sync::atomic::AtomicU64,
    min_free_disk_bytes: u64,
    cleanup_interval: Duration,
    disk_monitor_interval: Duration,
    strategy: std::sync::RwLock<CleanupStrategy>,
    custom: std::sync::RwLock<HashMap<String, CustomOrdering>>,
    // One pass at a time; concurrent checks coalesce into the running pass.
    pass: Mutex<()>,
}

impl EvictionEngine {
    pub fn new(
        core: Arc<CacheCore>,
        active: Arc<dyn ActiveKeys>,
        config: &CacheConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            active,
            budget: std::sync::atomic::AtomicU64::new(config.max_cache_size_bytes),
            min_free_disk_bytes: config.min_free_disk_bytes,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            disk_monitor_interval: Duration::from_secs(config.disk_space_monitor_interval_secs),
            strategy: std::sync::RwLock::new(config.cleanup_strategy.clone()),
            custom: std::sync::RwLock::new(HashMap::new()),
            pass: Mutex::new(()),
        })
    }

    pub fn set_budget(&self, budget: u64) {
        self.budget.store(budget, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn budget(&self) -> u64 {
        self.budget.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn set_strategy(&self, strategy: CleanupStrategy) {
        if let Ok(mut guard) = self.strategy.write() {
            *guard = strategy;
        }
    }

    /// Register a caller-supplied total order under a stable identifier.
    pub fn register_custom_strategy(&self, name: impl Into<String>, ordering: CustomOrdering) {
        if let Ok(mut guard) = self.custom.write() {
            guard.insert(name.into(), ordering);
        }
    }

    /// Budget/floor check after a size-increasing write. Returns without
    /// work when both constraints hold.
    pub async fn check(&self) {
        let budget = self.budget();
        let size = self.core.current_size().await.max(0) as u64;
        let disk_ok = self.disk_floor_met();
        if size <= budget && disk_ok {
            return;
        }
        self.run_pass(false).await;
    }

    /// Periodic cleanup: expired sweep first, then the budget pass.
    pub async fn periodic_cleanup(&self) {
        self.run_pass(true).await;
    }

    async fn run_pass(&self, sweep_expired_first: bool) {
        let _pass = self.pass.lock().await;

        if sweep_expired_first {
            self.sweep_expired().await;
        }

        let budget = self.budget();
        let mut size = self.core.current_size().await.max(0) as u64;
        if size <= budget && self.disk_floor_met() {
            return;
        }

        let strategy = self
            .strategy
            .read()
            .map(|s| s.clone())
            .unwrap_or(CleanupStrategy::Lru);
        let now = Utc::now();
        let mut candidates: Vec<ResourceMetadata> = self
            .core
            .snapshot_entries()
            .await
            .into_iter()
            .filter(|m| m.priority != Priority::Permanent && !self.active.is_active(&m.key))
            .collect();

        if let CleanupStrategy::ExpiredOnly = strategy {
            candidates.retain(|m| m.is_expired(now));
        }
        self.order_candidates(&mut candidates, &strategy, now);

        let mut freed = 0u64;
        let mut removed = 0usize;
        for candidate in candidates {
            if size <= budget && self.disk_floor_met() {
                break;
            }
            // An in-flight batch flush for the key settles before removal.
            if let Err(e) = self.core.flush(&candidate.key).await {
                debug!("Flush before eviction of {} failed: {e}", candidate.key);
            }
            match self.core.remove(&candidate.key).await {
                Ok(()) => {
                    freed += candidate.cached_bytes.max(0) as u64;
                    size = size.saturating_sub(candidate.cached_bytes.max(0) as u64);
                    removed += 1;
                    self.core.stats().record_eviction();
                }
                Err(e) => warn!("Eviction of {} failed: {e}", candidate.key),
            }
        }

        if removed > 0 {
            info!("Eviction pass removed {removed} entries, freed {freed} bytes");
        }
        if size > budget {
            // Everything left is permanent or active; retried on the next
            // triggering event.
            warn!(
                "Eviction pass could not satisfy budget: {size} bytes cached, budget {budget}"
            );
        }
    }

    fn order_candidates(
        &self,
        candidates: &mut [ResourceMetadata],
        strategy: &CleanupStrategy,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        // Expired entries are always eligible first, regardless of strategy.
        match strategy {
            CleanupStrategy::Lru | CleanupStrategy::Fifo | CleanupStrategy::ExpiredOnly => {
                candidates.sort_by(|a, b| {
                    expired_first(a, b, now).then_with(|| a.last_access.cmp(&b.last_access))
                });
            }
            CleanupStrategy::Lfu => {
                candidates.sort_by(|a, b| {
                    expired_first(a, b, now)
                        .then_with(|| a.access_count.cmp(&b.access_count))
                        .then_with(|| a.last_access.cmp(&b.last_access))
                });
            }
            CleanupStrategy::Priority => {
                candidates.sort_by(|a, b| {
                    expired_first(a, b, now)
                        .then_with(|| a.priority.cmp(&b.priority))
                        .then_with(|| a.last_access.cmp(&b.last_access))
                });
            }
            CleanupStrategy::Custom(name) => {
                let ordering = self
                    .custom
                    .read()
                    .ok()
                    .and_then(|guard| guard.get(name).cloned());
                match ordering {
                    Some(cmp) => candidates.sort_by(|a, b| {
                        expired_first(a, b, now).then_with(|| cmp(a, b))
                    }),
                    None => {
                        warn!("Unknown custom eviction strategy {name:?}, falling back to LRU");
                        candidates.sort_by(|a, b| {
                            expired_first(a, b, now).then_with(|| a.last_access.cmp(&b.last_access))
                        });
                    }
                }
            }
        }
    }

    /// Remove every expired, non-permanent, inactive entry.
    async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<ResourceMetadata> = self
            .core
            .snapshot_entries()
            .await
            .into_iter()
            .filter(|m| {
                m.is_expired(now)
                    && m.priority != Priority::Permanent
                    && !self.active.is_active(&m.key)
            })
            .collect();

        for m in expired {
            debug!("Expired sweep removing {}", m.key);
            if let Err(e) = self.core.flush(&m.key).await {
                debug!("Flush before expiry removal of {} failed: {e}", m.key);
            }
            match self.core.remove(&m.key).await {
                Ok(()) => self.core.stats().record_eviction(),
                Err(e) => warn!("Expiry removal of {} failed: {e}", m.key),
            }
        }
    }

    /// Targeted evictions for host memory-pressure notifications.
    pub async fn handle_memory_pressure(&self, level: MemoryPressure) {
        let _pass = self.pass.lock().await;
        let victims: Vec<ResourceMetadata> = self
            .core
            .snapshot_entries()
            .await
            .into_iter()
            .filter(|m| {
                if m.priority == Priority::Permanent || self.active.is_active(&m.key) {
                    return false;
                }
                match level {
                    MemoryPressure::Low => false,
                    MemoryPressure::Medium => m.priority == Priority::Low,
                    MemoryPressure::High => {
                        m.priority == Priority::Low
                            || (m.priority == Priority::Normal && !m.is_complete)
                    }
                    MemoryPressure::Critical => true,
                }
            })
            .collect();

        if victims.is_empty() {
            return;
        }
        info!(
            "Memory pressure {level:?}: evicting {} entries",
            victims.len()
        );
        for m in victims {
            if let Err(e) = self.core.flush(&m.key).await {
                debug!("Flush before pressure eviction of {} failed: {e}", m.key);
            }
            match self.core.remove(&m.key).await {
                Ok(()) => self.core.stats().record_eviction(),
                Err(e) => warn!("Pressure eviction of {} failed: {e}", m.key),
            }
        }
    }

    fn disk_floor_met(&self) -> bool {
        match available_disk_bytes(self.core.data_dir()) {
            Some(free) => free >= self.min_free_disk_bytes,
            None => true,
        }
    }

    /// Background cadences: the hourly cleanup pass and the disk monitor.
    pub fn spawn_timers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let cleanup = {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.cleanup_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    engine.periodic_cleanup().await;
                }
            })
        };
        let disk = {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.disk_monitor_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !engine.disk_floor_met() {
                        warn!("Disk space below floor, starting eviction pass");
                        engine.run_pass(false).await;
                    }
                }
            })
        };
        vec![cleanup, disk]
    }
}

fn expired_first(
    a: &ResourceMetadata,
    b: &ResourceMetadata,
    now: chrono::DateTime<chrono::Utc>,
) -> Ordering {
    b.is_expired(now).cmp(&a.is_expired(now))
}

#[cfg(unix)]
fn available_disk_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_disk_bytes(_path: &Path) -> Option<u64> {
    None
}
