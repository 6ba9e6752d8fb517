//! Service container.
//!
//! Holds the process-wide job coordinator and prefetch scheduler so every
//! screen shares the same registry and cache.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::config::CoreConfig;
use crate::jobs::{JobCoordinator, TransferPipeline};
use crate::prefetch::{CacheStats, HttpVideoFetcher, PrefetchScheduler, VideoFetcher};

/// Counters across both services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub jobs: usize,
    pub active_jobs: usize,
    pub cache: CacheStats,
}

/// Shared media services.
#[derive(Clone)]
pub struct MediaServices {
    pub jobs: JobCoordinator,
    pub prefetch: PrefetchScheduler,
    shutdown: CancellationToken,
}

impl MediaServices {
    /// Build the services with the HTTP fetcher writing to the configured cache dir.
    pub fn new(pipeline: Arc<dyn TransferPipeline>, config: CoreConfig) -> Result<Self> {
        let fetcher = HttpVideoFetcher::new(config.prefetch.cache_dir.clone())?;
        Self::with_fetcher(pipeline, Arc::new(fetcher), config)
    }

    pub fn with_fetcher(
        pipeline: Arc<dyn TransferPipeline>,
        fetcher: Arc<dyn VideoFetcher>,
        config: CoreConfig,
    ) -> Result<Self> {
        info!(
            cache_dir = %config.prefetch.cache_dir.display(),
            wait_timeout_ms = config.jobs.default_wait_timeout_ms,
            "Initializing media services"
        );
        let shutdown = CancellationToken::new();
        let prefetch =
            PrefetchScheduler::with_cancellation(fetcher, config.prefetch, shutdown.child_token())?;
        Ok(Self {
            jobs: JobCoordinator::with_config(pipeline, config.jobs),
            prefetch,
            shutdown,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when [`shutdown`](Self::shutdown) runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> ServiceStats {
        let jobs = self.jobs.list_jobs();
        ServiceStats {
            jobs: jobs.len(),
            active_jobs: jobs.iter().filter(|job| !job.is_terminal()).count(),
            cache: self.prefetch.stats(),
        }
    }

    /// Cancel unfinished jobs, stop the prefetch drain and drop the video cache.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut cancelled = 0;
        for job in self.jobs.list_jobs() {
            if !job.is_terminal() && self.jobs.cancel_job(&job.id).is_ok() {
                cancelled += 1;
            }
        }
        self.prefetch.clear_cache();
        info!(cancelled, "Media services shut down");
    }
}
