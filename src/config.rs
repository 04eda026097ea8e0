use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::error::{CacheError, Result};
use crate::eviction::CleanupStrategy;
use crate::metadata::ResourceKey;

/// Custom URL-to-key derivation supplied by the host.
pub type KeyFunction = dyn Fn(&Url) -> String + Send + Sync;

#[derive(Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory for data and metadata files
    pub cache_directory: Option<PathBuf>,

    /// Global byte budget enforced by eviction
    pub max_cache_size_bytes: u64,

    /// Extension of per-resource data files
    pub cache_file_extension: String,

    /// Extension of per-resource metadata records
    pub metadata_file_extension: String,

    /// Prefix prepended to the original URL scheme to form the
    /// player-facing custom-scheme URL
    pub cache_scheme_prefix: String,

    /// Watchdog timeout for a single preload task in seconds
    pub preload_task_timeout_secs: u64,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// Whether origin fetches may use cellular transport (recorded for the
    /// host; transport selection is outside this crate)
    pub allows_cellular_access: bool,

    /// Maximum concurrently running preload downloads
    pub max_concurrent_downloads: usize,

    /// Extra headers attached to every origin request
    pub custom_http_headers: HashMap<String, String>,

    /// Expiration applied to new entries, in seconds; None disables it
    pub default_expiration_interval_secs: Option<u64>,

    /// Cadence of the periodic cleanup pass in seconds
    pub cleanup_interval_secs: u64,

    /// Cadence of the disk-space monitor in seconds
    pub disk_space_monitor_interval_secs: u64,

    /// Ordering used when the byte budget or disk floor is exceeded
    pub cleanup_strategy: CleanupStrategy,

    /// Minimum free space to preserve on the cache volume
    pub min_free_disk_bytes: u64,

    /// Streaming chunk size for player-driven fetches
    pub player_chunk_size: usize,

    /// Streaming chunk size for preload fetches
    pub preload_chunk_size: usize,

    /// Write-coalescing window for buffered cache writes in milliseconds
    pub flush_interval_ms: u64,

    /// Debounce for best-effort statistics persistence in seconds
    pub stats_flush_interval_secs: u64,

    /// Maximum retry attempts for a preload task
    pub preload_max_retries: u32,

    /// Number of queued tasks dispatched together when slots free up
    pub preload_batch_size: usize,

    /// Whether long-queued preload tasks are bumped one priority level
    pub dynamic_aging_enabled: bool,

    /// Age after which a queued preload task is bumped, in seconds
    pub aging_threshold_secs: u64,

    /// Bound on the preload scheduler's terminal-task history
    pub preload_history_limit: usize,

    /// Custom URL-to-key derivation; defaults to SHA-256 of the URL string
    #[serde(skip)]
    pub key_function: Option<Arc<KeyFunction>>,
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("cache_directory", &self.cache_directory)
            .field("max_cache_size_bytes", &self.max_cache_size_bytes)
            .field("cache_file_extension", &self.cache_file_extension)
            .field("metadata_file_extension", &self.metadata_file_extension)
            .field("cache_scheme_prefix", &self.cache_scheme_prefix)
            .field("max_concurrent_downloads", &self.max_concurrent_downloads)
            .field("cleanup_strategy", &self.cleanup_strategy)
            .field("min_free_disk_bytes", &self.min_free_disk_bytes)
            .field(
                "key_function",
                &self.key_function.as_ref().map(|_| "custom"),
            )
            .finish_non_exhaustive()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: None,
            max_cache_size_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            cache_file_extension: "bmv".to_string(),
            metadata_file_extension: "bmm".to_string(),
            cache_scheme_prefix: "bmcache-".to_string(),
            preload_task_timeout_secs: 300,
            request_timeout_secs: 60,
            allows_cellular_access: true,
            max_concurrent_downloads: 3,
            custom_http_headers: HashMap::new(),
            default_expiration_interval_secs: None,
            cleanup_interval_secs: 3600,
            disk_space_monitor_interval_secs: 300,
            cleanup_strategy: CleanupStrategy::Lru,
            min_free_disk_bytes: 512 * 1024 * 1024, // 512 MiB
            player_chunk_size: 64 * 1024,
            preload_chunk_size: 256 * 1024,
            flush_interval_ms: 500,
            stats_flush_interval_secs: 60,
            preload_max_retries: 3,
            preload_batch_size: 1,
            dynamic_aging_enabled: true,
            aging_threshold_secs: 30,
            preload_history_limit: 100,
            key_function: None,
        }
    }
}

impl CacheConfig {
    /// Resolve the cache directory, falling back to the platform default.
    pub fn cache_directory(&self) -> AnyResult<PathBuf> {
        if let Some(ref dir) = self.cache_directory {
            Ok(dir.clone())
        } else {
            let base = dirs::cache_dir()
                .ok_or_else(|| anyhow::anyhow!("Failed to resolve platform cache directory"))?;
            Ok(base.join("spool").join("media"))
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size_bytes == 0 {
            return Err(CacheError::Config(
                "max_cache_size_bytes must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(CacheError::Config(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if self.cache_file_extension.is_empty() || self.metadata_file_extension.is_empty() {
            return Err(CacheError::Config("file extensions must be non-empty".into()));
        }
        if self.cache_scheme_prefix.is_empty()
            || !self
                .cache_scheme_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(CacheError::Config(
                "cache_scheme_prefix must be non-empty and a valid scheme fragment".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(CacheError::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.player_chunk_size == 0 || self.preload_chunk_size == 0 {
            return Err(CacheError::Config("chunk sizes must be greater than 0".into()));
        }
        if self.preload_batch_size == 0 {
            return Err(CacheError::Config(
                "preload_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Derive the resource key for a URL: the configured key function, or
    /// lowercase-hex SHA-256 of the URL string.
    pub fn resource_key(&self, url: &Url) -> ResourceKey {
        match &self.key_function {
            Some(f) => ResourceKey::from(f(url)),
            None => ResourceKey::for_url(url),
        }
    }

    /// Map an original URL to its player-facing custom-scheme URL.
    pub fn cache_url(&self, original: &Url) -> Result<Url> {
        let s = original.as_str();
        let rewritten = format!("{}{}", self.cache_scheme_prefix, s);
        Url::parse(&rewritten)
            .map_err(|e| CacheError::Config(format!("invalid cache URL for {s}: {e}")))
    }

    /// Map a player-facing custom-scheme URL back to the origin URL.
    /// Inverse of [`Self::cache_url`]: stripping the prefix from the scheme
    /// yields the origin URL exactly.
    pub fn original_url(&self, cache: &Url) -> Result<Url> {
        let s = cache.as_str();
        let stripped = s
            .strip_prefix(self.cache_scheme_prefix.as_str())
            .ok_or_else(|| {
                CacheError::NotFound(format!(
                    "URL {s} does not carry the {} scheme prefix",
                    self.cache_scheme_prefix
                ))
            })?;
        Url::parse(stripped)
            .map_err(|e| CacheError::Config(format!("invalid origin URL in {s}: {e}")))
    }
}
