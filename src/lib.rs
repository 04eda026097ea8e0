//! Streaming media cache between a player and remote HTTP(S) origins.
//!
//! Player byte-range requests are served from a sparse on-disk cache;
//! missing ranges are fetched from the origin, streamed back to the player
//! and written through to disk, so later plays and seeks are local.
//! Out-of-band preload tasks pull resource prefixes before playback.

pub mod config;
pub mod core;
pub mod error;
pub mod eviction;
pub mod file_slot;
pub mod hls;
pub mod loader;
pub mod media_cache;
pub mod metadata;
pub mod origin;
pub mod preload;
pub mod range_set;
pub mod registry;
pub mod stats;

#[cfg(test)]
mod integration_tests;

pub use crate::core::{CacheCore, ContentInfo, ProgressCallback, ProgressUpdate};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use eviction::{CleanupStrategy, EvictionEngine, MemoryPressure};
pub use loader::{DataSpec, PlayerRequest, PreloadHint, RequestEvent, RequestId};
pub use media_cache::MediaCache;
pub use metadata::{Priority, ResourceKey, ResourceMetadata};
pub use origin::{HttpOrigin, Origin, OriginResponse, ResponseMeta, RetryConfig};
pub use preload::{PreloadCounters, PreloadScheduler, PreloadTask, TaskId, TaskState};
pub use range_set::{ByteRange, RangeSet};
pub use registry::{ActiveKeys, LoaderRegistry};
pub use stats::CacheStats;
