use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::core::CacheCore;
use crate::error::CacheError;
use crate::loader::PreloadHint;
use crate::metadata::{Priority, ResourceKey};
use crate::registry::LoaderRegistry;
use crate::stats::StatsRecorder;

pub type TaskId = Uuid;

/// Preload a resource in its entirety (length unknown up front).
pub const WHOLE_RESOURCE: i64 = i64::MAX;

/// Lifecycle of a preload task. Terminal states are `Completed`,
/// `Failed` and `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed(String),
    Cancelled,
    Paused,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct PreloadTask {
    pub id: TaskId,
    pub url: Url,
    pub key: ResourceKey,
    pub length: i64,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub retry_count: u32,
    pub timeout_secs: u64,
    aged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadCounters {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

enum TaskFailure {
    Cancelled,
    TimedOut,
    Error(CacheError),
}

struct RunningEntry {
    task: PreloadTask,
    cancel: CancellationToken,
    pause_requested: bool,
}

struct SchedState {
    // Queued and Paused tasks, sorted by (priority desc, created_at asc).
    queued: Vec<PreloadTask>,
    running: HashMap<TaskId, RunningEntry>,
    history: VecDeque<PreloadTask>,
    counters: PreloadCounters,
}

/// Priority queue of preload tasks with bounded concurrency, retries,
/// pause/resume, cancellation and dynamic aging.
pub struct PreloadScheduler {
    config: CacheConfig,
    core: Arc<CacheCore>,
    registry: Arc<LoaderRegistry>,
    stats: Arc<StatsRecorder>,
    state: Mutex<SchedState>,
}

fn queue_rank(task: &PreloadTask) -> (Reverse<Priority>, DateTime<Utc>) {
    (Reverse(task.priority), task.created_at)
}

impl PreloadScheduler {
    pub fn new(
        config: CacheConfig,
        core: Arc<CacheCore>,
        registry: Arc<LoaderRegistry>,
        stats: Arc<StatsRecorder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            core,
            registry,
            stats,
            state: Mutex::new(SchedState {
                queued: Vec::new(),
                running: HashMap::new(),
                history: VecDeque::new(),
                counters: PreloadCounters::default(),
            }),
        })
    }

    /// Consume segment hints produced by loaders that cached a playlist.
    pub fn spawn_hint_pump(
        self: &Arc<Self>,
        mut hints: mpsc::UnboundedReceiver<PreloadHint>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            while let Some(hint) = hints.recv().await {
                scheduler
                    .add(hint.url, WHOLE_RESOURCE, hint.priority)
                    .await;
            }
        })
    }

    /// Enqueue a prefix fetch of `length` bytes and dispatch if a slot is
    /// free. Returns the task id.
    pub async fn add(self: &Arc<Self>, url: Url, length: i64, priority: Priority) -> TaskId {
        let task = PreloadTask {
            id: Uuid::new_v4(),
            key: self.config.resource_key(&url),
            url,
            length,
            priority,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            state: TaskState::Queued,
            retry_count: 0,
            timeout_secs: self.config.preload_task_timeout_secs,
            aged_at: None,
        };
        let id = task.id;

        {
            let mut state = self.state.lock().await;
            let idx = state
                .queued
                .partition_point(|t| queue_rank(t) <= queue_rank(&task));
            state.queued.insert(idx, task);
            state.counters.created += 1;
        }
        debug!("Preload task {id} enqueued");
        self.dispatch().await;
        id
    }

    /// Start queued tasks while slots are free.
    fn dispatch<'a>(self: &'a Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;

            if self.config.dynamic_aging_enabled {
                Self::age_queue(&mut state, self.config.aging_threshold_secs);
            }

            let slots = self
                .config
                .max_concurrent_downloads
                .saturating_sub(state.running.len());
            let batch = slots.min(self.config.preload_batch_size.max(1));

            for _ in 0..batch {
                let Some(idx) = state
                    .queued
                    .iter()
                    .position(|t| t.state == TaskState::Queued)
                else {
                    break;
                };
                let mut task = state.queued.remove(idx);
                task.state = TaskState::Running;
                task.started_at = Some(Utc::now());
                let token = CancellationToken::new();
                let id = task.id;
                debug!("Dispatching preload task {id} for {}", task.key);

                state.running.insert(
                    id,
                    RunningEntry {
                        task: task.clone(),
                        cancel: token.clone(),
                        pause_requested: false,
                    },
                );

                let scheduler = self.clone();
                tokio::spawn(async move {
                    let outcome = scheduler.execute(&task, &token).await;
                    scheduler.finish(id, outcome).await;
                });
            }
        })
    }

    // Queued tasks older than the threshold move up one priority level per
    // pass, then the queue is re-sorted.
    fn age_queue(state: &mut SchedState, threshold_secs: u64) {
        let now = Utc::now();
        let threshold = chrono::Duration::seconds(threshold_secs as i64);
        let mut bumped = false;
        for task in &mut state.queued {
            if task.state != TaskState::Queued || task.priority == Priority::Permanent {
                continue;
            }
            let basis = task.aged_at.unwrap_or(task.created_at);
            if now - basis > threshold {
                task.priority = task.priority.bumped();
                task.aged_at = Some(now);
                bumped = true;
            }
        }
        if bumped {
            state.queued.sort_by_key(queue_rank);
        }
    }

    async fn execute(
        self: &Arc<Self>,
        task: &PreloadTask,
        token: &CancellationToken,
    ) -> Result<(), TaskFailure> {
        let timeout = Duration::from_secs(task.timeout_secs.max(1));
        match tokio::time::timeout(timeout, self.execute_inner(task, token)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Preload task {} timed out", task.id);
                self.registry.cancel_preloads(&task.key);
                self.registry.preload_finished(&task.key);
                Err(TaskFailure::TimedOut)
            }
        }
    }

    async fn execute_inner(
        self: &Arc<Self>,
        task: &PreloadTask,
        token: &CancellationToken,
    ) -> Result<(), TaskFailure> {
        self.core
            .ensure_metadata(&task.key, task.url.as_str(), task.priority)
            .await
            .map_err(TaskFailure::Error)?;

        // Already fully present on disk: finish without a fetch.
        if let Some(m) = self.core.get_metadata(&task.key).await {
            if m.is_complete {
                return Ok(());
            }
            if m.covers_all() {
                return match self.core.mark_complete(&task.key, m.total_length).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(TaskFailure::Error(e)),
                };
            }
        }

        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                return Err(TaskFailure::Cancelled);
            }

            let receiver = self
                .registry
                .preload(&task.url, &task.key, task.length, task.priority)
                .await
                .map_err(TaskFailure::Error)?;

            let result = tokio::select! {
                _ = token.cancelled() => {
                    self.registry.cancel_preloads(&task.key);
                    self.registry.preload_finished(&task.key);
                    return Err(TaskFailure::Cancelled);
                }
                r = receiver => r.unwrap_or(Err(CacheError::Cancelled)),
            };
            self.registry.preload_finished(&task.key);

            match result {
                Ok(()) => return Ok(()),
                Err(CacheError::Cancelled) => return Err(TaskFailure::Cancelled),
                Err(e) if e.is_retriable() && attempt < self.config.preload_max_retries => {
                    attempt += 1;
                    self.bump_retry_count(task.id, attempt).await;
                    let delay = Duration::from_secs(1u64 << attempt.min(6));
                    warn!(
                        "Preload task {} attempt {attempt} failed: {e}. Retrying in {delay:?}",
                        task.id
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(TaskFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(TaskFailure::Error(e)),
            }
        }
    }

    async fn bump_retry_count(&self, id: TaskId, retry_count: u32) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.running.get_mut(&id) {
            entry.task.retry_count = retry_count;
        }
    }

    async fn finish(self: &Arc<Self>, id: TaskId, outcome: Result<(), TaskFailure>) {
        {
            let mut state = self.state.lock().await;
            let Some(entry) = state.running.remove(&id) else {
                return;
            };
            let mut task = entry.task;
            task.ended_at = Some(Utc::now());

            match outcome {
                Ok(()) => {
                    info!("Preload task {id} completed");
                    task.state = TaskState::Completed;
                    state.counters.completed += 1;
                    self.stats.record_preload_completed();
                    Self::push_history(&mut state, task, self.config.preload_history_limit);
                }
                Err(TaskFailure::Cancelled) if entry.pause_requested => {
                    debug!("Preload task {id} paused");
                    task.state = TaskState::Paused;
                    task.ended_at = None;
                    let idx = state
                        .queued
                        .partition_point(|t| queue_rank(t) <= queue_rank(&task));
                    state.queued.insert(idx, task);
                }
                Err(TaskFailure::Cancelled) => {
                    info!("Preload task {id} cancelled");
                    task.state = TaskState::Cancelled;
                    state.counters.cancelled += 1;
                    self.stats.record_preload_cancelled();
                    Self::push_history(&mut state, task, self.config.preload_history_limit);
                }
                Err(TaskFailure::TimedOut) => {
                    task.state = TaskState::Failed("timed out".into());
                    state.counters.failed += 1;
                    self.stats.record_preload_failed();
                    Self::push_history(&mut state, task, self.config.preload_history_limit);
                }
                Err(TaskFailure::Error(e)) => {
                    warn!("Preload task {id} failed: {e}");
                    task.state = TaskState::Failed(e.to_string());
                    state.counters.failed += 1;
                    self.stats.record_preload_failed();
                    Self::push_history(&mut state, task, self.config.preload_history_limit);
                }
            }
        }
        self.dispatch().await;
    }

    fn push_history(state: &mut SchedState, task: PreloadTask, limit: usize) {
        state.history.push_front(task);
        state.history.truncate(limit);
    }

    /// Snapshot of one task, wherever it currently lives.
    pub async fn status(&self, id: TaskId) -> Option<PreloadTask> {
        let state = self.state.lock().await;
        state
            .queued
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .or_else(|| state.running.get(&id).map(|e| e.task.clone()))
            .or_else(|| state.history.iter().find(|t| t.id == id).cloned())
    }

    pub async fn counters(&self) -> PreloadCounters {
        self.state.lock().await.counters
    }

    pub async fn queued_len(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    pub async fn running_len(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// Pause a queued or running task. A running task's session is
    /// cancelled; its partial cache is kept and the task re-queues as
    /// `Paused`.
    pub async fn pause(&self, id: TaskId) -> bool {
        let mut state = self.state.lock().await;
        if let Some(task) = state.queued.iter_mut().find(|t| t.id == id) {
            if task.state == TaskState::Queued {
                task.state = TaskState::Paused;
                return true;
            }
            return false;
        }
        if let Some(entry) = state.running.get_mut(&id) {
            entry.pause_requested = true;
            let key = entry.task.key.clone();
            entry.cancel.cancel();
            drop(state);
            self.registry.cancel_preloads(&key);
            return true;
        }
        false
    }

    /// Return a paused task to the dispatch candidates.
    pub async fn resume(self: &Arc<Self>, id: TaskId) -> bool {
        let resumed = {
            let mut state = self.state.lock().await;
            match state.queued.iter_mut().find(|t| t.id == id) {
                Some(task) if task.state == TaskState::Paused => {
                    task.state = TaskState::Queued;
                    true
                }
                _ => false,
            }
        };
        if resumed {
            self.dispatch().await;
        }
        resumed
    }

    /// Cancel a task. Idempotent: true iff the task was queued or running.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.state.lock().await;
        if let Some(idx) = state.queued.iter().position(|t| t.id == id) {
            let mut task = state.queued.remove(idx);
            task.state = TaskState::Cancelled;
            task.ended_at = Some(Utc::now());
            state.counters.cancelled += 1;
            self.stats.record_preload_cancelled();
            Self::push_history(&mut state, task, self.config.preload_history_limit);
            return true;
        }
        if let Some(entry) = state.running.get(&id) {
            let key = entry.task.key.clone();
            entry.cancel.cancel();
            drop(state);
            self.registry.cancel_preloads(&key);
            return true;
        }
        false
    }

    /// Transition every non-terminal task to `Cancelled`.
    pub async fn cancel_all(&self) {
        let running_keys = {
            let mut state = self.state.lock().await;
            let queued: Vec<PreloadTask> = state.queued.drain(..).collect();
            for mut task in queued {
                task.state = TaskState::Cancelled;
                task.ended_at = Some(Utc::now());
                state.counters.cancelled += 1;
                self.stats.record_preload_cancelled();
                Self::push_history(&mut state, task, self.config.preload_history_limit);
            }
            let keys: Vec<ResourceKey> = state
                .running
                .values()
                .map(|e| e.task.key.clone())
                .collect();
            for entry in state.running.values() {
                entry.cancel.cancel();
            }
            keys
        };
        for key in running_keys {
            self.registry.cancel_preloads(&key);
        }
    }

    /// Pause every queued and running task.
    pub async fn pause_all(&self) {
        let running_ids: Vec<TaskId> = {
            let mut state = self.state.lock().await;
            for task in &mut state.queued {
                if task.state == TaskState::Queued {
                    task.state = TaskState::Paused;
                }
            }
            state.running.keys().copied().collect()
        };
        for id in running_ids {
            self.pause(id).await;
        }
    }

    /// Resume every paused task.
    pub async fn resume_all(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            for task in &mut state.queued {
                if task.state == TaskState::Paused {
                    task.state = TaskState::Queued;
                }
            }
        }
        self.dispatch().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderOptions;
    use crate::origin::{HttpOrigin, RetryConfig};
    use tempfile::TempDir;

    fn test_setup(
        dir: &TempDir,
        max_concurrent: usize,
    ) -> (Arc<PreloadScheduler>, Arc<CacheCore>) {
        let config = CacheConfig {
            cache_directory: Some(dir.path().to_path_buf()),
            flush_interval_ms: 0,
            max_concurrent_downloads: max_concurrent,
            preload_task_timeout_secs: 10,
            preload_max_retries: 0,
            ..Default::default()
        };
        let stats = Arc::new(StatsRecorder::new(
            dir.path().join("statistics.json"),
            Duration::from_secs(3600),
        ));
        let core = Arc::new(CacheCore::new(&config, stats.clone()).unwrap());
        let origin = Arc::new(HttpOrigin::new(&config).unwrap());
        let registry = LoaderRegistry::new(
            core.clone(),
            origin,
            LoaderOptions {
                chunk_size: 256 * 1024,
                retry: RetryConfig {
                    max_retries: 0,
                    initial_delay: Duration::from_millis(10),
                    ..Default::default()
                },
                segment_sink: None,
            },
        );
        let scheduler = PreloadScheduler::new(config, core.clone(), registry, stats);
        (scheduler, core)
    }

    async fn wait_terminal(scheduler: &PreloadScheduler, id: TaskId) -> TaskState {
        for _ in 0..500 {
            if let Some(task) = scheduler.status(id).await {
                if task.state.is_terminal() {
                    return task.state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_preload_completes_against_mock_origin() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/seg.ts")
            .with_status(206)
            .with_header("Content-Range", "bytes 0-8191/8192")
            .with_header("Content-Type", "video/mp2t")
            .with_body(vec![4u8; 8192])
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let (scheduler, core) = test_setup(&dir, 3);
        let url = Url::parse(&format!("{}/seg.ts", server.url())).unwrap();
        let key = scheduler.config.resource_key(&url);

        let id = scheduler.add(url, WHOLE_RESOURCE, Priority::Normal).await;
        assert_eq!(wait_terminal(&scheduler, id).await, TaskState::Completed);

        let m = core.get_metadata(&key).await.unwrap();
        assert!(m.is_complete);
        assert_eq!(m.cached_bytes, 8192);
        assert_eq!(scheduler.counters().await.completed, 1);
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _core) = test_setup(&dir, 2);

        for n in 0..5 {
            let url = Url::parse(&format!("https://origin.invalid/{n}.bin")).unwrap();
            scheduler.add(url, 1024, Priority::Normal).await;
        }

        // At most two tasks run at any instant until all five settle.
        for _ in 0..500 {
            assert!(scheduler.running_len().await <= 2);
            if scheduler.counters().await.failed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.counters().await.failed, 5);
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_tie_break() {
        let dir = TempDir::new().unwrap();
        // Zero slots: nothing dispatches, so the queue order is observable.
        let (scheduler, _core) = test_setup(&dir, 0);

        let low = scheduler
            .add(
                Url::parse("https://origin.invalid/low.bin").unwrap(),
                1024,
                Priority::Low,
            )
            .await;
        let high = scheduler
            .add(
                Url::parse("https://origin.invalid/high.bin").unwrap(),
                1024,
                Priority::High,
            )
            .await;
        let normal_a = scheduler
            .add(
                Url::parse("https://origin.invalid/na.bin").unwrap(),
                1024,
                Priority::Normal,
            )
            .await;
        let normal_b = scheduler
            .add(
                Url::parse("https://origin.invalid/nb.bin").unwrap(),
                1024,
                Priority::Normal,
            )
            .await;

        let state = scheduler.state.lock().await;
        let ids: Vec<TaskId> = state.queued.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high, normal_a, normal_b, low]);
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _core) = test_setup(&dir, 0);

        let id = scheduler
            .add(
                Url::parse("https://origin.invalid/queued.bin").unwrap(),
                1024,
                Priority::Low,
            )
            .await;

        assert!(scheduler.cancel(id).await);
        assert_eq!(
            scheduler.status(id).await.unwrap().state,
            TaskState::Cancelled
        );
        // Idempotent: a second cancel of a terminal task reports false.
        assert!(!scheduler.cancel(id).await);
        assert_eq!(scheduler.counters().await.cancelled, 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_queued_task() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _core) = test_setup(&dir, 0);

        let id = scheduler
            .add(
                Url::parse("https://origin.invalid/paused.bin").unwrap(),
                1024,
                Priority::Low,
            )
            .await;

        assert!(scheduler.pause(id).await);
        assert_eq!(scheduler.status(id).await.unwrap().state, TaskState::Paused);
        // Paused tasks are not dispatch candidates and cannot pause again.
        assert!(!scheduler.pause(id).await);

        assert!(scheduler.resume(id).await);
        assert_eq!(scheduler.status(id).await.unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_cancel_all_clears_queue() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _core) = test_setup(&dir, 0);

        for n in 0..4 {
            scheduler
                .add(
                    Url::parse(&format!("https://origin.invalid/q{n}.bin")).unwrap(),
                    1024,
                    Priority::Low,
                )
                .await;
        }

        scheduler.cancel_all().await;
        assert_eq!(scheduler.queued_len().await, 0);
        assert_eq!(scheduler.counters().await.cancelled, 4);
    }

    #[tokio::test]
    async fn test_already_complete_resource_finishes_without_fetch() {
        let dir = TempDir::new().unwrap();
        let (scheduler, core) = test_setup(&dir, 3);
        let url = Url::parse("https://origin.invalid/done.bin").unwrap();
        let key = scheduler.config.resource_key(&url);

        core.ensure_metadata(&key, url.as_str(), Priority::Normal)
            .await
            .unwrap();
        core.update_content_info(
            &key,
            &crate::origin::ResponseMeta {
                content_type: Some("video/mp4".into()),
                total_length: Some(2048),
                supports_range: true,
                body_offset: 0,
            },
        )
        .await
        .unwrap();
        core.write(&key, 0, vec![1u8; 2048]).await.unwrap();
        core.mark_complete(&key, Some(2048)).await.unwrap();

        let id = scheduler.add(url, WHOLE_RESOURCE, Priority::Normal).await;
        assert_eq!(wait_terminal(&scheduler, id).await, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_aging_bumps_queued_priority() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            cache_directory: Some(dir.path().to_path_buf()),
            max_concurrent_downloads: 0,
            aging_threshold_secs: 0,
            ..Default::default()
        };
        let stats = Arc::new(StatsRecorder::new(
            dir.path().join("statistics.json"),
            Duration::from_secs(3600),
        ));
        let core = Arc::new(CacheCore::new(&config, stats.clone()).unwrap());
        let origin = Arc::new(HttpOrigin::new(&config).unwrap());
        let registry = LoaderRegistry::new(
            core.clone(),
            origin,
            LoaderOptions {
                chunk_size: 256 * 1024,
                retry: RetryConfig::default(),
                segment_sink: None,
            },
        );
        let scheduler = PreloadScheduler::new(config, core, registry, stats);

        let id = scheduler
            .add(
                Url::parse("https://origin.invalid/aged.bin").unwrap(),
                1024,
                Priority::Low,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Enqueueing anything re-runs the aging pass first.
        scheduler
            .add(
                Url::parse("https://origin.invalid/other.bin").unwrap(),
                1024,
                Priority::Low,
            )
            .await;

        let aged = scheduler.status(id).await.unwrap();
        assert!(aged.priority > Priority::Low);
    }
}
