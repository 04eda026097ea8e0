use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::{CacheCore, ContentInfo};
use crate::error::{CacheError, Result};
use crate::hls;
use crate::metadata::{Priority, ResourceKey};
use crate::origin::{Origin, ResponseMeta, RetryConfig};
use crate::range_set::ByteRange;

pub type RequestId = u64;

/// The data portion of a player request: `length == None` means "to the
/// end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSpec {
    pub offset: i64,
    pub length: Option<i64>,
}

/// A range-scoped loading request handed over by the player interceptor.
#[derive(Debug, Clone)]
pub struct PlayerRequest {
    pub id: RequestId,
    pub wants_content_info: bool,
    pub data: Option<DataSpec>,
    pub events: mpsc::UnboundedSender<RequestEvent>,
}

/// Responses streamed back to one player request.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    ContentInfo(ContentInfo),
    Data(Vec<u8>),
    Finished,
    Failed(CacheError),
}

/// A segment URL discovered while caching an HLS playlist.
#[derive(Debug, Clone)]
pub struct PreloadHint {
    pub url: Url,
    pub priority: Priority,
}

enum LoaderMessage {
    Attach(PlayerRequest),
    AttachPreload {
        length: i64,
        done: oneshot::Sender<Result<()>>,
    },
    Detach(RequestId),
    CancelPreloads,
}

/// Handle to a per-resource loader task.
///
/// The task multiplexes request attachments, cancellation and origin body
/// chunks over one receive loop; at most one origin session is in flight
/// per resource.
#[derive(Clone)]
pub struct Loader {
    key: ResourceKey,
    tx: mpsc::UnboundedSender<LoaderMessage>,
    cancel: CancellationToken,
    attached: Arc<AtomicUsize>,
}

/// Tunables injected by the registry.
#[derive(Clone)]
pub struct LoaderOptions {
    pub chunk_size: usize,
    pub retry: RetryConfig,
    pub segment_sink: Option<mpsc::UnboundedSender<PreloadHint>>,
}

impl Loader {
    pub fn spawn(
        key: ResourceKey,
        url: Url,
        core: Arc<CacheCore>,
        origin: Arc<dyn Origin>,
        options: LoaderOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let attached = Arc::new(AtomicUsize::new(0));

        let task = LoaderTask {
            key: key.clone(),
            url,
            core,
            origin,
            options,
            requests: Vec::new(),
            preloads: Vec::new(),
            attached: attached.clone(),
            rx_closed: false,
            hls_scanned: false,
            stalled_at: None,
        };
        let token = cancel.clone();
        tokio::spawn(async move { task.run(rx, token).await });

        Self {
            key,
            tx,
            cancel,
            attached,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Attach a player request. If the task has already exited the request
    /// is handed back so the caller can re-route it.
    pub fn attach(&self, request: PlayerRequest) -> std::result::Result<(), PlayerRequest> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        self.tx.send(LoaderMessage::Attach(request)).map_err(|e| {
            self.attached.fetch_sub(1, Ordering::SeqCst);
            match e.0 {
                LoaderMessage::Attach(request) => request,
                _ => unreachable!("attach sends only Attach messages"),
            }
        })
    }

    /// Whether the loader task has exited and can no longer accept work.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Attach a preload demand for `[0, length - 1]`. The returned channel
    /// resolves when the prefix is cached, the task fails, or it is
    /// cancelled.
    pub fn attach_preload(&self, length: i64) -> oneshot::Receiver<Result<()>> {
        let (done, receiver) = oneshot::channel();
        self.attached.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(LoaderMessage::AttachPreload { length, done })
            .is_err()
        {
            self.attached.fetch_sub(1, Ordering::SeqCst);
            // Receiver observes the dropped sender as cancellation.
        }
        receiver
    }

    pub fn detach(&self, id: RequestId) {
        let _ = self.tx.send(LoaderMessage::Detach(id));
    }

    /// Fail every preload attachment with `Cancelled`, leaving player
    /// requests on this key untouched. Partial cache is preserved.
    pub fn cancel_preloads(&self) {
        let _ = self.tx.send(LoaderMessage::CancelPreloads);
    }

    /// Synchronous, non-suspending activity probe for eviction.
    pub fn is_active(&self) -> bool {
        self.attached.load(Ordering::SeqCst) > 0
    }

    /// Cancel the origin session and fail every attached request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct ActiveRequest {
    request: PlayerRequest,
    next_offset: i64,
    info_sent: bool,
    done: bool,
}

impl ActiveRequest {
    fn new(request: PlayerRequest) -> Self {
        let next_offset = request.data.map(|d| d.offset).unwrap_or(0);
        Self {
            request,
            next_offset,
            info_sent: false,
            done: false,
        }
    }

    // Last byte this request wants, None while it cannot be bounded yet.
    // Once the total is known the window clamps to it, so requests at or
    // past EOF terminate with whatever the resource holds.
    fn end(&self, total: Option<i64>) -> Option<i64> {
        let spec = self.request.data?;
        match spec.length {
            Some(len) => {
                let end = spec.offset + len - 1;
                Some(match total {
                    Some(t) => end.min(t - 1),
                    None => end,
                })
            }
            None => total.map(|t| t - 1),
        }
    }

    fn is_satisfied(&self, total: Option<i64>) -> bool {
        if self.request.wants_content_info && !self.info_sent {
            return false;
        }
        match self.request.data {
            None => true,
            Some(_) => match self.end(total) {
                Some(end) => self.next_offset > end,
                None => false,
            },
        }
    }
}

struct PreloadAttachment {
    target_len: i64,
    done: oneshot::Sender<Result<()>>,
}

enum FetchResult {
    Done,
    RangeNotSatisfiable,
    Error(CacheError),
    Cancelled,
}

struct LoaderTask {
    key: ResourceKey,
    url: Url,
    core: Arc<CacheCore>,
    origin: Arc<dyn Origin>,
    options: LoaderOptions,
    requests: Vec<ActiveRequest>,
    preloads: Vec<PreloadAttachment>,
    attached: Arc<AtomicUsize>,
    rx_closed: bool,
    hls_scanned: bool,
    // Offset of the last session that completed without contributing any
    // bytes; a second stall at the same offset fails the demands instead
    // of fetching forever.
    stalled_at: Option<i64>,
}

impl LoaderTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<LoaderMessage>,
        cancel: CancellationToken,
    ) {
        debug!("Loader for {} started", self.key);
        loop {
            self.serve_from_cache().await;

            if self.requests.is_empty() && self.preloads.is_empty() {
                if self.rx_closed {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.drain_pending(&mut rx);
                        self.fail_all(CacheError::Cancelled);
                        break;
                    }
                    msg = rx.recv() => match msg {
                        Some(m) => self.handle_message(m).await,
                        None => break,
                    }
                }
                continue;
            }

            let Some(start) = self.first_missing_target().await else {
                continue;
            };

            if self.stalled_at == Some(start) {
                warn!("Origin for {} made no progress at offset {start}", self.key);
                self.stalled_at = None;
                self.fail_all(CacheError::Network("origin returned no data".into()));
                continue;
            }
            let bytes_before = self
                .core
                .get_metadata(&self.key)
                .await
                .map(|m| m.cached_bytes)
                .unwrap_or(0);

            let mut attempt = 0u32;
            let mut resume_at = start;
            loop {
                match self.fetch_once(resume_at, &mut rx, &cancel).await {
                    FetchResult::Done => {
                        let bytes_after = self
                            .core
                            .get_metadata(&self.key)
                            .await
                            .map(|m| m.cached_bytes)
                            .unwrap_or(0);
                        let demands_remain =
                            !self.requests.is_empty() || !self.preloads.is_empty();
                        self.stalled_at =
                            (bytes_after == bytes_before && demands_remain).then_some(start);
                        break;
                    }
                    FetchResult::RangeNotSatisfiable => {
                        self.finish_at_eof(resume_at).await;
                        break;
                    }
                    FetchResult::Cancelled => {
                        self.drain_pending(&mut rx);
                        self.fail_all(CacheError::Cancelled);
                        debug!("Loader for {} cancelled", self.key);
                        return;
                    }
                    FetchResult::Error(e) => {
                        if !e.is_retriable() || attempt >= self.options.retry.max_retries {
                            warn!("Fetch for {} failed terminally: {e}", self.key);
                            self.fail_all(e);
                            break;
                        }
                        let delay = self.options.retry.delay_for(attempt);
                        attempt += 1;
                        warn!(
                            "Fetch attempt {attempt} for {} failed: {e}. Retrying in {delay:?}",
                            self.key
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                self.drain_pending(&mut rx);
                                self.fail_all(CacheError::Cancelled);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        // Resume at the first offset the cache is missing.
                        resume_at = self.core.next_missing_offset(&self.key, start).await;
                    }
                }
            }

            if cancel.is_cancelled() {
                self.fail_all(CacheError::Cancelled);
                return;
            }
        }
        debug!("Loader for {} exited", self.key);
    }

    async fn handle_message(&mut self, message: LoaderMessage) {
        match message {
            LoaderMessage::Attach(request) => {
                debug!("Request {} attached to {}", request.id, self.key);
                self.requests.push(ActiveRequest::new(request));
            }
            LoaderMessage::AttachPreload { length, done } => {
                debug!("Preload of {length} bytes attached to {}", self.key);
                self.preloads.push(PreloadAttachment {
                    target_len: length,
                    done,
                });
            }
            LoaderMessage::Detach(id) => {
                let before = self.requests.len();
                self.requests.retain(|r| r.request.id != id);
                let removed = before - self.requests.len();
                if removed > 0 {
                    self.attached.fetch_sub(removed, Ordering::SeqCst);
                }
            }
            LoaderMessage::CancelPreloads => {
                for p in self.preloads.drain(..) {
                    let _ = p.done.send(Err(CacheError::Cancelled));
                    self.attached.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Answer every attached request as far as the cache allows.
    async fn serve_from_cache(&mut self) {
        let info = self.core.content_info(&self.key).await;
        let total = info.as_ref().and_then(|i| i.total_length);

        let mut i = 0;
        while i < self.requests.len() {
            // Content-info sub-request: answered as soon as it is known.
            if self.requests[i].request.wants_content_info && !self.requests[i].info_sent {
                if let Some(ci) = info
                    .as_ref()
                    .filter(|ci| ci.total_length.is_some() || ci.content_type.is_some())
                {
                    let _ = self.requests[i]
                        .request
                        .events
                        .send(RequestEvent::ContentInfo(ci.clone()));
                    self.requests[i].info_sent = true;
                }
            }

            // Data sub-request: stream every contiguously cached chunk.
            if self.requests[i].request.data.is_some() {
                loop {
                    let next = self.requests[i].next_offset;
                    let end = self.requests[i].end(total);
                    if let Some(end) = end {
                        if next > end {
                            break;
                        }
                    }
                    let gap = self.core.next_missing_offset(&self.key, next).await;
                    if gap <= next {
                        break;
                    }
                    let chunk_end = (next + self.options.chunk_size as i64 - 1)
                        .min(gap - 1)
                        .min(end.unwrap_or(i64::MAX));
                    let Some(range) = ByteRange::try_new(next, chunk_end) else {
                        break;
                    };
                    match self.core.read(&self.key, range).await {
                        Ok(Some(data)) => {
                            let len = data.len() as i64;
                            let _ = self.requests[i].request.events.send(RequestEvent::Data(data));
                            self.requests[i].next_offset += len;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Cached read for {} failed: {e}", self.key);
                            break;
                        }
                    }
                }
            }

            if self.requests[i].is_satisfied(total) {
                let _ = self.requests[i].request.events.send(RequestEvent::Finished);
                self.requests[i].done = true;
            }
            i += 1;
        }
        self.reap_finished();

        // Preload demands are met once the prefix is contiguously cached.
        if !self.preloads.is_empty() {
            let covered_to = self.core.next_missing_offset(&self.key, 0).await;
            let complete = self
                .core
                .get_metadata(&self.key)
                .await
                .is_some_and(|m| m.is_complete);
            let mut remaining = Vec::new();
            for preload in self.preloads.drain(..) {
                let target = match total {
                    Some(t) => preload.target_len.min(t),
                    None => preload.target_len,
                };
                if complete || covered_to >= target {
                    let _ = preload.done.send(Ok(()));
                    self.attached.fetch_sub(1, Ordering::SeqCst);
                } else {
                    remaining.push(preload);
                }
            }
            self.preloads = remaining;
        }
    }

    fn reap_finished(&mut self) {
        let before = self.requests.len();
        self.requests.retain(|r| !r.done);
        let removed = before - self.requests.len();
        if removed > 0 {
            self.attached.fetch_sub(removed, Ordering::SeqCst);
        }
    }

    /// First offset the network must provide, or None when nothing is
    /// missing for the attached demands.
    async fn first_missing_target(&self) -> Option<i64> {
        let info = self.core.content_info(&self.key).await;
        let total = info.as_ref().and_then(|i| i.total_length);
        let mut target: Option<i64> = None;

        for r in &self.requests {
            if r.request.wants_content_info && !r.info_sent && total.is_none() {
                let gap = self.core.next_missing_offset(&self.key, 0).await;
                target = Some(target.map_or(gap, |t| t.min(gap)));
            }
            if r.request.data.is_some() && !r.is_satisfied(total) {
                let gap = self.core.next_missing_offset(&self.key, r.next_offset).await;
                target = Some(target.map_or(gap, |t| t.min(gap)));
            }
        }
        for _ in &self.preloads {
            let gap = self.core.next_missing_offset(&self.key, 0).await;
            target = Some(target.map_or(gap, |t| t.min(gap)));
        }
        target
    }

    // Largest byte the current demands need, for a bounded range request.
    // None means open-ended.
    fn demand_end(&self, total: Option<i64>) -> Option<i64> {
        let mut end = 0i64;
        for r in &self.requests {
            match r.end(total) {
                Some(e) => end = end.max(e),
                None => return None,
            }
        }
        if self.requests.iter().any(|r| r.request.wants_content_info && !r.info_sent)
            && total.is_none()
        {
            // Length is still unknown; leave the request open so the
            // response headers can teach us the total.
            return None;
        }
        for p in &self.preloads {
            let target = match total {
                Some(t) => (p.target_len.min(t)) - 1,
                None => {
                    if p.target_len == i64::MAX {
                        // Whole-resource preload with an unknown length.
                        return None;
                    }
                    p.target_len - 1
                }
            };
            end = end.max(target);
        }
        Some(end)
    }

    async fn fetch_once(
        &mut self,
        start: i64,
        rx: &mut mpsc::UnboundedReceiver<LoaderMessage>,
        cancel: &CancellationToken,
    ) -> FetchResult {
        let info = self.core.content_info(&self.key).await;
        let total = info.as_ref().and_then(|i| i.total_length);
        let range_end = self.demand_end(total);

        let response = tokio::select! {
            _ = cancel.cancelled() => return FetchResult::Cancelled,
            r = self.origin.fetch(&self.url, Some((start, range_end))) => r,
        };
        let mut response = match response {
            Ok(r) => r,
            Err(CacheError::HttpStatus(416)) => return FetchResult::RangeNotSatisfiable,
            Err(e) => return FetchResult::Error(e),
        };

        // Headers are folded into metadata once; repeats only fill gaps.
        if let Err(e) = self.core.update_content_info(&self.key, &response.meta).await {
            return FetchResult::Error(e);
        }
        self.serve_from_cache().await;
        if self.requests.is_empty() && self.preloads.is_empty() {
            // The headers alone satisfied everything attached.
            return FetchResult::Done;
        }

        let mut offset = response.meta.body_offset;
        loop {
            let chunk = if self.rx_closed {
                tokio::select! {
                    _ = cancel.cancelled() => return FetchResult::Cancelled,
                    c = response.body.next() => c,
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return FetchResult::Cancelled,
                    msg = rx.recv() => {
                        match msg {
                            Some(m) => {
                                self.handle_message(m).await;
                                // A late attachment may want bytes that are
                                // still sitting in the batch buffer.
                                let _ = self.core.flush(&self.key).await;
                                self.serve_from_cache().await;
                                if self.requests.is_empty() && self.preloads.is_empty() {
                                    // Nobody left to stream for; the bytes
                                    // written so far stay as partial cache.
                                    return FetchResult::Done;
                                }
                            }
                            None => self.rx_closed = true,
                        }
                        continue;
                    }
                    c = response.body.next() => c,
                }
            };

            match chunk {
                None => {
                    if let Err(e) = self.finish_body(&response.meta).await {
                        return FetchResult::Error(e);
                    }
                    return FetchResult::Done;
                }
                Some(Err(e)) => return FetchResult::Error(e),
                Some(Ok(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.forward_chunk(offset, &data);
                    let len = data.len() as i64;
                    if let Err(e) = self.core.write(&self.key, offset, data).await {
                        return FetchResult::Error(e);
                    }
                    offset += len;
                }
            }
        }
    }

    /// Push the freshly received bytes to every request whose window
    /// overlaps them. Delivery is in-order per request: only the slice
    /// starting at the request's next offset is forwarded.
    fn forward_chunk(&mut self, offset: i64, data: &[u8]) {
        let chunk_end = offset + data.len() as i64 - 1;
        for r in &mut self.requests {
            let Some(spec) = r.request.data else { continue };
            if r.next_offset < offset || r.next_offset > chunk_end {
                continue;
            }
            let from = (r.next_offset - offset) as usize;
            let to = match spec.length {
                Some(len) => {
                    let request_end = spec.offset + len - 1;
                    ((request_end.min(chunk_end) - offset) as usize + 1).min(data.len())
                }
                None => data.len(),
            };
            if from >= to {
                continue;
            }
            let _ = r
                .request
                .events
                .send(RequestEvent::Data(data[from..to].to_vec()));
            r.next_offset = offset + to as i64;
        }
    }

    async fn finish_body(&mut self, meta: &ResponseMeta) -> Result<()> {
        self.core.flush(&self.key).await?;

        if let Some(m) = self.core.get_metadata(&self.key).await {
            if m.covers_all() && !m.is_complete {
                if let Err(e) = self.core.mark_complete(&self.key, m.total_length).await {
                    warn!("Completion check for {} failed: {e}", self.key);
                }
            }
        }

        self.scan_playlist(meta).await;
        self.serve_from_cache().await;
        Ok(())
    }

    /// Resource bodies that are HLS playlists have their segments enqueued
    /// for preload; the playlist itself stays cached as opaque bytes.
    async fn scan_playlist(&mut self, meta: &ResponseMeta) {
        if self.hls_scanned {
            return;
        }
        let Some(sink) = self.options.segment_sink.clone() else {
            return;
        };
        if !hls::is_playlist(meta.content_type.as_deref(), &self.url) {
            return;
        }
        let Some(m) = self.core.get_metadata(&self.key).await else {
            return;
        };
        if !m.covers_all() {
            return;
        }
        let Some(total) = m.total_length.filter(|t| *t > 0) else {
            return;
        };
        let Some(range) = ByteRange::try_new(0, total - 1) else {
            return;
        };
        let Ok(Some(body)) = self.core.read(&self.key, range).await else {
            return;
        };

        self.hls_scanned = true;
        let urls = hls::referenced_urls(&self.url, &body);
        if urls.is_empty() {
            return;
        }
        info!(
            "Playlist {} references {} URLs, enqueueing for preload",
            self.key,
            urls.len()
        );
        for url in urls {
            let _ = sink.send(PreloadHint {
                url,
                priority: m.priority,
            });
        }
    }

    /// A 416 at `start` means the resource ends there: record the length,
    /// mark complete when the prefix is whole, and settle the requests.
    async fn finish_at_eof(&mut self, start: i64) {
        let info = self.core.content_info(&self.key).await;
        if info.as_ref().and_then(|i| i.total_length).is_none() && start > 0 {
            let meta = ResponseMeta {
                content_type: None,
                total_length: Some(start),
                supports_range: true,
                body_offset: start,
            };
            if let Err(e) = self.core.update_content_info(&self.key, &meta).await {
                warn!("Recording EOF for {} failed: {e}", self.key);
                return;
            }
        }
        if let Some(m) = self.core.get_metadata(&self.key).await {
            if m.covers_all() && !m.is_complete {
                let _ = self.core.mark_complete(&self.key, m.total_length).await;
            }
        }
        self.serve_from_cache().await;
    }

    /// Pull any not-yet-processed attachments out of the channel so a
    /// cancellation can fail them instead of silently dropping them.
    fn drain_pending(&mut self, rx: &mut mpsc::UnboundedReceiver<LoaderMessage>) {
        while let Ok(message) = rx.try_recv() {
            match message {
                LoaderMessage::Attach(request) => {
                    self.requests.push(ActiveRequest::new(request));
                }
                LoaderMessage::AttachPreload { length, done } => {
                    self.preloads.push(PreloadAttachment {
                        target_len: length,
                        done,
                    });
                }
                LoaderMessage::Detach(_) | LoaderMessage::CancelPreloads => {}
            }
        }
    }

    /// Deliver a terminal failure to every attached request and preload.
    fn fail_all(&mut self, error: CacheError) {
        for r in self.requests.drain(..) {
            let _ = r.request.events.send(RequestEvent::Failed(error.clone()));
            self.attached.fetch_sub(1, Ordering::SeqCst);
        }
        for p in self.preloads.drain(..) {
            let _ = p.done.send(Err(error.clone()));
            self.attached.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
