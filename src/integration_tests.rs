//! End-to-end scenarios across the assembled cache.

use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::mpsc;
use url::Url;

use crate::config::CacheConfig;
use crate::core::{CacheCore, ContentInfo};
use crate::error::CacheError;
use crate::loader::{DataSpec, LoaderOptions, PlayerRequest, RequestEvent};
use crate::media_cache::MediaCache;
use crate::metadata::Priority;
use crate::origin::{Origin, OriginResponse, ResponseMeta, RetryConfig};
use crate::preload::{PreloadScheduler, TaskState};
use crate::range_set::ByteRange;
use crate::registry::LoaderRegistry;
use crate::stats::StatsRecorder;

fn test_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        cache_directory: Some(dir.path().to_path_buf()),
        flush_interval_ms: 0,
        ..Default::default()
    }
}

async fn ready_cache(config: CacheConfig) -> Arc<MediaCache> {
    let cache = MediaCache::new(config).unwrap();
    cache.init().await.unwrap();
    cache
}

fn data_request(
    id: u64,
    offset: i64,
    length: i64,
    wants_content_info: bool,
) -> (PlayerRequest, mpsc::UnboundedReceiver<RequestEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PlayerRequest {
            id,
            wants_content_info,
            data: Some(DataSpec {
                offset,
                length: Some(length),
            }),
            events: tx,
        },
        rx,
    )
}

async fn collect(
    rx: &mut mpsc::UnboundedReceiver<RequestEvent>,
) -> (Option<ContentInfo>, Vec<u8>, Option<CacheError>) {
    let mut info = None;
    let mut data = Vec::new();
    let mut error = None;
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("request timed out")
    {
        match event {
            RequestEvent::ContentInfo(ci) => info = Some(ci),
            RequestEvent::Data(chunk) => data.extend_from_slice(&chunk),
            RequestEvent::Finished => break,
            RequestEvent::Failed(e) => {
                error = Some(e);
                break;
            }
        }
    }
    (info, data, error)
}

// Cold read of a seekable MP4: the first 64 KiB of a 1 MiB resource is
// fetched with a range request, forwarded to the player and cached.
#[tokio::test]
async fn test_cold_read_of_seekable_mp4() {
    let mut server = mockito::Server::new_async().await;
    let body: Vec<u8> = (0..65536u32).map(|i| (i % 253) as u8).collect();
    let mock = server
        .mock("GET", "/movie.mp4")
        .with_status(206)
        .with_header("Content-Type", "video/mp4")
        .with_header("Content-Range", "bytes 0-65535/1048576")
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let cache = ready_cache(test_config(&dir)).await;
    let original = Url::parse(&format!("{}/movie.mp4", server.url())).unwrap();
    let player_url = cache.cache_url(&original).unwrap();

    let (request, mut rx) = data_request(1, 0, 65536, true);
    cache.handle_request(&player_url, request).await.unwrap();

    let (info, data, error) = collect(&mut rx).await;
    assert!(error.is_none());
    assert_eq!(data, body);
    let info = info.unwrap();
    assert_eq!(info.total_length, Some(1048576));
    assert!(info.supports_range);

    let metadata = cache.metadata(&original).await.unwrap().unwrap();
    assert_eq!(metadata.total_length, Some(1048576));
    assert!(metadata.supports_range);
    assert_eq!(
        metadata.ranges.as_slice(),
        &[ByteRange::try_new(0, 65535).unwrap()]
    );
    assert_eq!(metadata.cached_bytes, 65536);
    assert!(!metadata.is_complete);
    assert_eq!(cache.current_cache_size().await, 65536);
    mock.assert_async().await;
}

// Warm seek hit: a range inside the cached prefix is served without any
// further origin contact, and the access counters move.
#[tokio::test]
async fn test_warm_seek_hit_avoids_network() {
    let mut server = mockito::Server::new_async().await;
    let body: Vec<u8> = (0..65536u32).map(|i| (i % 253) as u8).collect();
    let mock = server
        .mock("GET", "/movie.mp4")
        .with_status(206)
        .with_header("Content-Type", "video/mp4")
        .with_header("Content-Range", "bytes 0-65535/1048576")
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let cache = ready_cache(test_config(&dir)).await;
    let original = Url::parse(&format!("{}/movie.mp4", server.url())).unwrap();
    let player_url = cache.cache_url(&original).unwrap();

    let (request, mut rx) = data_request(1, 0, 65536, true);
    cache.handle_request(&player_url, request).await.unwrap();
    collect(&mut rx).await;

    let before = cache.metadata(&original).await.unwrap().unwrap();
    assert_eq!(before.access_count, 0);

    let (request, mut rx) = data_request(2, 10000, 10001, false);
    cache.handle_request(&player_url, request).await.unwrap();
    let (_, data, error) = collect(&mut rx).await;
    assert!(error.is_none());
    assert_eq!(data, &body[10000..=20000]);

    let after = cache.metadata(&original).await.unwrap().unwrap();
    assert_eq!(after.access_count, 1);
    assert!(after.last_access >= before.last_access);

    // Exactly one origin request across both plays.
    mock.assert_async().await;
}

// Eviction under LRU: three 500-byte resources against a 1000-byte budget.
// The write that pushes the total to 1500 evicts the least recently used.
#[tokio::test]
async fn test_eviction_under_lru_budget() {
    let mut server = mockito::Server::new_async().await;
    for name in ["a", "b", "c"] {
        server
            .mock("GET", format!("/{name}.bin").as_str())
            .with_status(206)
            .with_header("Content-Type", "application/octet-stream")
            .with_header("Content-Range", "bytes 0-499/500")
            .with_body(vec![7u8; 500])
            .create_async()
            .await;
    }

    let dir = TempDir::new().unwrap();
    let cache = ready_cache(CacheConfig {
        max_cache_size_bytes: 1000,
        ..test_config(&dir)
    })
    .await;

    let mut urls = Vec::new();
    for name in ["a", "b", "c"] {
        let url = Url::parse(&format!("{}/{name}.bin", server.url())).unwrap();
        let id = cache
            .preload_all(url.clone(), Priority::Normal)
            .await
            .unwrap();
        for _ in 0..500 {
            match cache.preload_status(id).await {
                Some(task) if task.state.is_terminal() => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert_eq!(
            cache.preload_status(id).await.unwrap().state,
            TaskState::Completed
        );
        urls.push(url);
    }

    // The eviction pass triggered by the last write removed the oldest.
    assert!(cache.metadata(&urls[0]).await.unwrap().is_none());
    assert!(cache.metadata(&urls[1]).await.unwrap().is_some());
    assert!(cache.metadata(&urls[2]).await.unwrap().is_some());
    assert_eq!(cache.current_cache_size().await, 1000);
    assert!(!dir
        .path()
        .join(format!("{}.bmv", cache.resource_key(&urls[0])))
        .exists());
}

/// Origin that trickles a large body so mid-flight behavior is observable.
struct TricklingOrigin {
    total: i64,
    chunk: usize,
}

#[async_trait::async_trait]
impl Origin for TricklingOrigin {
    async fn fetch(
        &self,
        _url: &Url,
        range: Option<(i64, Option<i64>)>,
    ) -> crate::error::Result<OriginResponse> {
        let start = range.map(|(s, _)| s).unwrap_or(0);
        let total = self.total;
        let chunk = self.chunk;
        let meta = ResponseMeta {
            content_type: Some("video/mp4".into()),
            total_length: Some(total),
            supports_range: true,
            body_offset: start,
        };
        let body = futures::stream::unfold(start, move |offset| async move {
            if offset >= total {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            let len = chunk.min((total - offset) as usize);
            Some((Ok(vec![0xAB; len]), offset + len as i64))
        })
        .boxed();
        Ok(OriginResponse { meta, body })
    }
}

// Preload cancellation mid-flight: a 10 MiB preload is cancelled after
// 2 MiB has landed; the partial prefix stays valid and readable.
#[tokio::test]
async fn test_preload_cancellation_mid_flight() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let stats = Arc::new(StatsRecorder::new(
        dir.path().join("statistics.json"),
        Duration::from_secs(3600),
    ));
    let core = Arc::new(CacheCore::new(&config, stats.clone()).unwrap());
    let origin = Arc::new(TricklingOrigin {
        total: 10 * 1024 * 1024,
        chunk: 64 * 1024,
    });
    let registry = LoaderRegistry::new(
        core.clone(),
        origin,
        LoaderOptions {
            chunk_size: 256 * 1024,
            retry: RetryConfig::default(),
            segment_sink: None,
        },
    );
    let scheduler = PreloadScheduler::new(config.clone(), core.clone(), registry, stats);

    let url = Url::parse("https://origin.invalid/big.mp4").unwrap();
    let key = config.resource_key(&url);
    let id = scheduler
        .add(url, crate::preload::WHOLE_RESOURCE, Priority::Normal)
        .await;

    // Wait until at least 2 MiB is cached.
    for _ in 0..2000 {
        if core.current_size().await >= 2 * 1024 * 1024 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(core.current_size().await >= 2 * 1024 * 1024);

    assert!(scheduler.cancel(id).await);
    for _ in 0..500 {
        if let Some(task) = scheduler.status(id).await {
            if task.state.is_terminal() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        scheduler.status(id).await.unwrap().state,
        TaskState::Cancelled
    );

    let metadata = core.get_metadata(&key).await.unwrap();
    assert!(!metadata.is_complete);
    assert!(metadata.cached_bytes >= 2 * 1024 * 1024);
    assert_eq!(metadata.ranges.as_slice().len(), 1);
    assert_eq!(metadata.ranges.as_slice()[0].start, 0);

    // The partial prefix serves reads.
    let hit = core
        .read(&key, ByteRange::try_new(0, 1023).unwrap())
        .await
        .unwrap();
    assert_eq!(hit.unwrap().len(), 1024);
}

// Reconciliation on startup: a data file with no metadata record becomes a
// complete entry sized by the file.
#[tokio::test]
async fn test_startup_reconciliation_of_orphan_file() {
    let dir = TempDir::new().unwrap();
    let url = Url::parse("https://cdn.example.com/orphan.mp4").unwrap();

    let key = {
        let config = test_config(&dir);
        config.resource_key(&url)
    };
    std::fs::write(dir.path().join(format!("{key}.bmv")), vec![9u8; 8192]).unwrap();

    let cache = ready_cache(test_config(&dir)).await;

    let metadata = cache.metadata(&url).await.unwrap().unwrap();
    assert_eq!(metadata.total_length, Some(8192));
    assert!(metadata.is_complete);
    assert_eq!(metadata.priority, Priority::Normal);
    assert_eq!(
        metadata.ranges.as_slice(),
        &[ByteRange::try_new(0, 8191).unwrap()]
    );
    assert_eq!(cache.current_cache_size().await, 8192);
}

// Metadata survives a restart: cached ranges reload from the durable
// records and reads stay warm with no origin contact.
#[tokio::test]
async fn test_persistence_across_restart() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/keep.bin")
        .with_status(206)
        .with_header("Content-Type", "application/octet-stream")
        .with_header("Content-Range", "bytes 0-4095/4096")
        .with_body(vec![6u8; 4096])
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let original = Url::parse(&format!("{}/keep.bin", server.url())).unwrap();

    {
        let cache = ready_cache(test_config(&dir)).await;
        let id = cache
            .preload_all(original.clone(), Priority::High)
            .await
            .unwrap();
        for _ in 0..500 {
            match cache.preload_status(id).await {
                Some(task) if task.state.is_terminal() => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        cache.shutdown().await;
    }

    let cache = ready_cache(test_config(&dir)).await;
    let metadata = cache.metadata(&original).await.unwrap().unwrap();
    assert!(metadata.is_complete);
    assert_eq!(metadata.cached_bytes, 4096);
    assert_eq!(metadata.priority, Priority::High);
    assert_eq!(cache.current_cache_size().await, 4096);

    // A warm request after restart stays local.
    let player_url = cache.cache_url(&original).unwrap();
    let (request, mut rx) = data_request(1, 0, 4096, false);
    cache.handle_request(&player_url, request).await.unwrap();
    let (_, data, error) = collect(&mut rx).await;
    assert!(error.is_none());
    assert_eq!(data.len(), 4096);
    mock.assert_async().await;
}

// A player cancel mid-stream keeps the partial cache and frees the loader.
#[tokio::test]
async fn test_player_cancel_mid_stream() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let stats = Arc::new(StatsRecorder::new(
        dir.path().join("statistics.json"),
        Duration::from_secs(3600),
    ));
    let core = Arc::new(CacheCore::new(&config, stats.clone()).unwrap());
    let origin = Arc::new(TricklingOrigin {
        total: 1024 * 1024,
        chunk: 16 * 1024,
    });
    let registry = LoaderRegistry::new(
        core.clone(),
        origin,
        LoaderOptions {
            chunk_size: 64 * 1024,
            retry: RetryConfig::default(),
            segment_sink: None,
        },
    );

    let url = Url::parse("https://origin.invalid/stream.mp4").unwrap();
    let key = config.resource_key(&url);
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry
        .handle_player_request(
            &url,
            &key,
            PlayerRequest {
                id: 42,
                wants_content_info: false,
                data: Some(DataSpec {
                    offset: 0,
                    length: None,
                }),
                events: tx,
            },
        )
        .await
        .unwrap();

    // Let some bytes land, then cancel the only request.
    for _ in 0..1000 {
        if core.current_size().await >= 64 * 1024 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    registry.handle_player_cancel(&key, 42);
    assert_eq!(registry.loader_count(), 0);

    // Delivered bytes arrived before the cancellation terminated the rest.
    let mut received = 0usize;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
    {
        if let RequestEvent::Data(chunk) = event {
            received += chunk.len();
        }
    }
    assert!(received > 0);

    let metadata = core.get_metadata(&key).await.unwrap();
    assert!(metadata.cached_bytes > 0);
    assert!(!metadata.is_complete);
}
