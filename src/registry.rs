use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::core::CacheCore;
use crate::error::Result;
use crate::loader::{Loader, LoaderOptions, PlayerRequest, RequestId};
use crate::metadata::{Priority, ResourceKey};
use crate::origin::Origin;

/// One-way view of loader activity handed to the eviction engine. Must be
/// callable without suspending, from any thread.
pub trait ActiveKeys: Send + Sync {
    fn is_active(&self, key: &ResourceKey) -> bool;
}

struct RegisteredLoader {
    loader: Loader,
    player_requests: HashSet<RequestId>,
    preloads: usize,
}

/// Demultiplexes incoming requests to per-resource loaders and owns their
/// lifecycle. Map mutations are serialized behind one lock; lookups used
/// by synchronous observers never suspend.
pub struct LoaderRegistry {
    core: Arc<CacheCore>,
    origin: Arc<dyn Origin>,
    options: LoaderOptions,
    loaders: RwLock<HashMap<ResourceKey, RegisteredLoader>>,
}

impl LoaderRegistry {
    pub fn new(core: Arc<CacheCore>, origin: Arc<dyn Origin>, options: LoaderOptions) -> Arc<Self> {
        Arc::new(Self {
            core,
            origin,
            options,
            loaders: RwLock::new(HashMap::new()),
        })
    }

    fn obtain(&self, key: &ResourceKey, url: &Url) -> Loader {
        let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
        if loaders
            .get(key)
            .is_some_and(|entry| entry.loader.is_closed())
        {
            loaders.remove(key);
        }
        let entry = loaders.entry(key.clone()).or_insert_with(|| {
            debug!("Spawning loader for {key}");
            RegisteredLoader {
                loader: Loader::spawn(
                    key.clone(),
                    url.clone(),
                    self.core.clone(),
                    self.origin.clone(),
                    self.options.clone(),
                ),
                player_requests: HashSet::new(),
                preloads: 0,
            }
        });
        entry.loader.clone()
    }

    /// Route a player request to the key's loader, creating metadata and
    /// the loader on first contact.
    pub async fn handle_player_request(
        &self,
        url: &Url,
        key: &ResourceKey,
        request: PlayerRequest,
    ) -> Result<()> {
        self.core
            .ensure_metadata(key, url.as_str(), Priority::Normal)
            .await?;

        let request_id = request.id;
        let mut request = request;
        // A loader can exit between lookup and attach; replace it once.
        for _ in 0..2 {
            let loader = self.obtain(key, url);
            match loader.attach(request) {
                Ok(()) => {
                    let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = loaders.get_mut(key) {
                        entry.player_requests.insert(request_id);
                    }
                    return Ok(());
                }
                Err(returned) => {
                    request = returned;
                    let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
                    if loaders
                        .get(key)
                        .is_some_and(|entry| entry.loader.is_closed())
                    {
                        loaders.remove(key);
                    }
                }
            }
        }
        Err(crate::error::CacheError::Cancelled)
    }

    /// Detach a request; a loader with no remaining player requests and no
    /// preload attachment is cancelled and removed.
    pub fn handle_player_cancel(&self, key: &ResourceKey, id: RequestId) {
        let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = loaders.get_mut(key) else {
            return;
        };
        entry.player_requests.remove(&id);
        entry.loader.detach(id);
        if entry.player_requests.is_empty() && entry.preloads == 0 {
            debug!("Loader for {key} has no attachments, cancelling");
            entry.loader.cancel();
            loaders.remove(key);
        }
    }

    /// Attach a preload demand for the first `length` bytes of `url`.
    /// The receiver resolves when the prefix is cached or the fetch fails.
    pub async fn preload(
        &self,
        url: &Url,
        key: &ResourceKey,
        length: i64,
        priority: Priority,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.core
            .ensure_metadata(key, url.as_str(), priority)
            .await?;

        let loader = self.obtain(key, url);
        let receiver = loader.attach_preload(length);
        let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = loaders.get_mut(key) {
            entry.preloads += 1;
        }
        Ok(receiver)
    }

    /// Bookkeeping for a preload that reached a terminal state. Removes the
    /// loader when nothing else is attached.
    pub fn preload_finished(&self, key: &ResourceKey) {
        let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = loaders.get_mut(key) else {
            return;
        };
        entry.preloads = entry.preloads.saturating_sub(1);
        if entry.player_requests.is_empty() && entry.preloads == 0 {
            entry.loader.cancel();
            loaders.remove(key);
        }
    }

    /// Cancel the preload attachments on a key without touching player
    /// requests (used by preload pause and cancellation).
    pub fn cancel_preloads(&self, key: &ResourceKey) {
        let loaders = self.loaders.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = loaders.get(key) {
            entry.loader.cancel_preloads();
        }
    }

    /// Cancel and remove the loader for `key`, failing everything attached.
    pub fn cancel_key(&self, key: &ResourceKey) {
        let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = loaders.remove(key) {
            entry.loader.cancel();
        }
    }

    /// Cancel every loader.
    pub fn cancel_all(&self) {
        let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in loaders.drain() {
            entry.loader.cancel();
        }
    }

    pub fn loader_count(&self) -> usize {
        self.loaders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl ActiveKeys for LoaderRegistry {
    fn is_active(&self, key: &ResourceKey) -> bool {
        let loaders = self.loaders.read().unwrap_or_else(|e| e.into_inner());
        loaders.get(key).is_some_and(|entry| entry.loader.is_active())
    }
}
