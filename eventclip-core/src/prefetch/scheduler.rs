//! Windowed prefetch scheduler.
//!
//! Screens report the current scroll position through
//! [`PrefetchScheduler::preload_videos_around`]. Videos in the narrow prefetch
//! window are queued and drained a few at a time; once the cache grows past
//! its capacity, everything outside the wider keep window is evicted.
//!
//! Every network fetch holds one of `max_concurrent` fetch slots until the
//! fetcher returns, including fetches whose entry was evicted meanwhile.
//! Fetches for the same id never overlap.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::{VideoDescriptor, VideoFetcher};
use super::store::{CacheStats, CachedVideo, InFlight, Lookup, VideoCacheStore};
use super::window::{keep_range, prefetch_range};
use crate::config::PrefetchConfig;
use crate::{Error, Result};

struct Inner {
    store: VideoCacheStore,
    fetcher: Arc<dyn VideoFetcher>,
    config: PrefetchConfig,
    queue: Mutex<VecDeque<VideoDescriptor>>,
    /// Set while a drain pass runs.
    pumping: AtomicBool,
    /// One permit per running network fetch.
    fetch_slots: Semaphore,
    /// Serializes fetch and file release per video id.
    id_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn id_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.id_locks.entry(id.to_string()).or_default().value())
    }

    /// Drop the per-id lock once nobody else holds a handle to it.
    fn forget_id_lock(&self, id: &str, lock: Arc<AsyncMutex<()>>) {
        drop(lock);
        self.id_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn run_fetch(&self, video: &VideoDescriptor, request: &InFlight) {
        let Ok(_slot) = self.fetch_slots.acquire().await else {
            self.store
                .fail(&video.id, request, "fetch slots closed".to_string());
            return;
        };
        if !self.store.is_current(&video.id, request) {
            debug!(video_id = %video.id, "Skipping fetch for evicted video");
            return;
        }

        let outcome = AssertUnwindSafe(self.fetcher.fetch(video))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::fetch(&video.id, "fetcher panicked")));

        match outcome {
            Ok(uri) => {
                if self.store.complete(&video.id, request, uri.clone()) {
                    debug!(video_id = %video.id, "Video cached");
                } else if !self.store.contains(&video.id) && !self.store.references(&uri) {
                    debug!(video_id = %video.id, "Discarding fetch for evicted video");
                    self.fetcher.release(&uri).await;
                }
            }
            Err(e) => {
                warn!(video_id = %video.id, error = %e, "Video fetch failed");
                let reason = match e {
                    Error::Fetch { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.store.fail(&video.id, request, reason);
            }
        }
    }
}

/// Prefetch cache shared by every screen. Cheap to clone.
#[derive(Clone)]
pub struct PrefetchScheduler {
    inner: Arc<Inner>,
}

impl PrefetchScheduler {
    pub fn new(fetcher: Arc<dyn VideoFetcher>, config: PrefetchConfig) -> Result<Self> {
        Self::with_cancellation(fetcher, config, CancellationToken::new())
    }

    /// Build a scheduler that stops draining once `shutdown` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `fetcher` - performs the per-video downloads
    /// * `config` - window sizes, capacity and fetch concurrency
    /// * `shutdown` - usually a child of the host's shutdown token
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `config` fails validation.
    pub fn with_cancellation(
        fetcher: Arc<dyn VideoFetcher>,
        config: PrefetchConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store: VideoCacheStore::new(),
                fetcher,
                fetch_slots: Semaphore::new(config.max_concurrent),
                config,
                queue: Mutex::new(VecDeque::new()),
                pumping: AtomicBool::new(false),
                id_locks: DashMap::new(),
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Download a video, or join the download already running for its id.
    ///
    /// Returns the local URI. On failure the entry is dropped so a later call
    /// fetches again.
    pub async fn preload_video(&self, video: &VideoDescriptor) -> Result<String> {
        let request = match self.inner.store.begin(&video.id) {
            Lookup::Ready(uri) => return Ok(uri),
            Lookup::Pending(request) => request,
            Lookup::Started(request) => {
                debug!(video_id = %video.id, "Starting video fetch");
                self.spawn_fetch(video.clone(), Arc::clone(&request));
                request
            }
        };

        request
            .wait()
            .await
            .map_err(|reason| Error::fetch(&video.id, reason))
    }

    // The fetch runs detached so a dropped caller can't strand the placeholder.
    fn spawn_fetch(&self, video: VideoDescriptor, request: InFlight) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let lock = inner.id_lock(&video.id);
            {
                let _same_id = lock.lock().await;
                inner.run_fetch(&video, &request).await;
            }
            inner.forget_id_lock(&video.id, lock);
        });
    }

    pub fn get_cached_video(&self, id: &str) -> Option<CachedVideo> {
        self.inner.store.get(id)
    }

    /// True once the video is downloaded. Downloads in progress don't count.
    pub fn is_video_cached(&self, id: &str) -> bool {
        self.inner.store.is_ready(id)
    }

    /// Queue the prefetch window around `current_index`, kick the drain, then
    /// run an eviction pass.
    ///
    /// Queued videos that fell out of the keep window are dropped first.
    pub fn preload_videos_around(&self, videos: &[VideoDescriptor], current_index: usize) {
        if self.is_shut_down() {
            debug!(current_index, "Prefetch scheduler shut down; ignoring scroll");
            return;
        }

        let config = &self.inner.config;
        let window = prefetch_range(videos.len(), current_index, config.behind, config.ahead);
        let keep = self.keep_ids(videos, current_index);

        let (dropped, queued) = {
            let mut queue = self.inner.queue.lock();
            let before = queue.len();
            queue.retain(|queued| keep.contains(queued.id.as_str()));
            let dropped = before - queue.len();

            let kept = queue.len();
            for video in &videos[window] {
                let already_queued = queue.iter().any(|queued| queued.id == video.id);
                if !already_queued && !self.inner.store.contains(&video.id) {
                    queue.push_back(video.clone());
                }
            }
            (dropped, queue.len() - kept)
        };
        if dropped > 0 || queued > 0 {
            debug!(current_index, queued, dropped, "Updated prefetch queue");
        }

        self.schedule_drain(None);
        self.cleanup_old_cache(videos, current_index);
    }

    fn keep_ids<'a>(&self, videos: &'a [VideoDescriptor], current_index: usize) -> HashSet<&'a str> {
        let range = keep_range(videos.len(), current_index, self.inner.config.keep_radius);
        videos[range].iter().map(|video| video.id.as_str()).collect()
    }

    fn schedule_drain(&self, delay: Option<Duration>) {
        if self.is_shut_down() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; prefetch queue left pending");
            return;
        };
        let this = self.clone();
        runtime.spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            this.drain().await;
        });
    }

    /// Run one pass over at most `max_concurrent` queued videos.
    async fn drain(&self) {
        if self.is_shut_down() || self.inner.pumping.swap(true, Ordering::AcqRel) {
            return;
        }

        let batch: Vec<VideoDescriptor> = {
            let mut queue = self.inner.queue.lock();
            let take = self.inner.config.max_concurrent.min(queue.len());
            queue.drain(..take).collect()
        };

        let results = join_all(batch.iter().map(|video| self.preload_video(video))).await;
        for (video, result) in batch.iter().zip(results) {
            if let Err(e) = result {
                debug!(video_id = %video.id, error = %e, "Prefetch skipped");
            }
        }

        self.inner.pumping.store(false, Ordering::Release);

        if !self.inner.queue.lock().is_empty() {
            self.schedule_drain(Some(self.inner.config.drain_delay()));
        }
    }

    /// Evict entries outside the keep window once the cache exceeds capacity.
    ///
    /// Returns the number of evicted entries.
    pub fn cleanup_old_cache(&self, videos: &[VideoDescriptor], current_index: usize) -> usize {
        if self.inner.store.len() <= self.inner.config.capacity {
            return 0;
        }

        let keep = self.keep_ids(videos, current_index);
        let evicted = self.inner.store.retain_ids(&keep);
        let count = evicted.len();
        if count > 0 {
            info!(current_index, evicted = count, remaining = self.inner.store.len(), "Evicted cached videos");
        }
        self.release_files(evicted);
        count
    }

    /// Drop every entry and all queued work.
    pub fn clear_cache(&self) {
        self.inner.queue.lock().clear();
        let removed = self.inner.store.clear();
        info!(removed = removed.len(), "Video cache cleared");
        self.release_files(removed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            queued: self.inner.queue.lock().len(),
            ..self.inner.store.stats()
        }
    }

    // Runs under the per-id lock so a refetch of the same id can't reuse a
    // file that is about to be deleted.
    fn release_files(&self, videos: Vec<CachedVideo>) {
        let files: Vec<(String, String)> = videos
            .into_iter()
            .filter_map(|v| v.local_uri.map(|uri| (v.id, uri)))
            .collect();
        if files.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            for (id, uri) in files {
                let lock = inner.id_lock(&id);
                {
                    let _same_id = lock.lock().await;
                    if !inner.store.contains(&id) && !inner.store.references(&uri) {
                        inner.fetcher.release(&uri).await;
                    }
                }
                inner.forget_id_lock(&id, lock);
            }
        });
    }
}
