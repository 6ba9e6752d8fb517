//! Public entry point for background uploads.
//!
//! A capture screen calls [`JobCoordinator::create_job`] and
//! [`JobCoordinator::start_upload`], then navigates away carrying only the job
//! id. Any later screen re-attaches with [`JobCoordinator::subscribe`] or
//! blocks with [`JobCoordinator::wait_for_job`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::model::{MediaType, TransformOptions, UploadJob, UploadResult};
use super::pipeline::TransferPipeline;
use super::registry::{JobRegistry, ProgressCallback};
use crate::config::JobsConfig;
use crate::events::{JobEvent, JobEventBroadcaster, Subscription};
use crate::{Error, Result};

/// Façade over the job registry and the transfer pipeline.
#[derive(Clone)]
pub struct JobCoordinator {
    registry: Arc<JobRegistry>,
    pipeline: Arc<dyn TransferPipeline>,
    config: JobsConfig,
}

impl JobCoordinator {
    pub fn new(pipeline: Arc<dyn TransferPipeline>) -> Self {
        Self::with_config(pipeline, JobsConfig::default())
    }

    pub fn with_config(pipeline: Arc<dyn TransferPipeline>, config: JobsConfig) -> Self {
        let events = JobEventBroadcaster::with_capacity(config.event_capacity);
        Self {
            registry: Arc::new(JobRegistry::new(events)),
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Register a new job in `created`. No work starts until [`start_upload`](Self::start_upload).
    pub fn create_job(
        &self,
        source_uri: impl Into<String>,
        user_id: impl Into<String>,
        media_type: MediaType,
        options: TransformOptions,
    ) -> Result<String> {
        let source_uri = source_uri.into();
        let user_id = user_id.into();

        if source_uri.trim().is_empty() {
            return Err(Error::validation("source uri must not be empty"));
        }
        if user_id.trim().is_empty() {
            return Err(Error::validation("user id must not be empty"));
        }
        options.validate()?;

        Ok(self
            .registry
            .insert(UploadJob::new(source_uri, user_id, media_type, options)))
    }

    /// Start the transfer in the background and return immediately.
    ///
    /// `on_progress` receives the latest percentage on every tick until the
    /// job finishes or is cancelled. Fails with `NotFound` for unknown jobs
    /// and `InvalidStateTransition` if the job was already started.
    pub fn start_upload<F>(&self, job_id: &str, on_progress: F) -> Result<()>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let callback: ProgressCallback = Arc::new(on_progress);
        self.registry
            .start(job_id, Arc::clone(&self.pipeline), Some(callback))
    }

    /// [`start_upload`](Self::start_upload) without a progress callback.
    pub fn start(&self, job_id: &str) -> Result<()> {
        self.registry.start(job_id, Arc::clone(&self.pipeline), None)
    }

    /// Observe every later mutation of the job.
    ///
    /// Missed progress is not replayed; read [`get_job`](Self::get_job) first
    /// for the current state.
    pub fn subscribe<F>(&self, job_id: &str, listener: F) -> Result<Subscription>
    where
        F: Fn(&UploadJob) + Send + Sync + 'static,
    {
        self.registry.subscribe(job_id, listener)
    }

    /// Receive status/progress events for every job.
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.events().subscribe()
    }

    pub fn get_job(&self, job_id: &str) -> Option<UploadJob> {
        self.registry.get(job_id)
    }

    pub fn list_jobs(&self) -> Vec<UploadJob> {
        self.registry.list()
    }

    pub fn job_count(&self) -> usize {
        self.registry.len()
    }

    /// True if the job is unknown or uploaded.
    pub fn is_job_ready(&self, job_id: &str) -> bool {
        self.registry.is_ready(job_id)
    }

    /// Wait for the job to finish using the configured default deadline.
    pub async fn wait_for_job(&self, job_id: &str) -> Result<UploadJob> {
        self.wait_for_job_with_timeout(job_id, self.config.default_wait_timeout())
            .await
    }

    /// Resolve with the terminal snapshot, or fail with `Timeout` / `NotFound`.
    pub async fn wait_for_job_with_timeout(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<UploadJob> {
        self.registry.wait(job_id, timeout).await
    }

    /// Wait for the job and return its remote paths.
    ///
    /// Unlike [`wait_for_job`](Self::wait_for_job), failed and cancelled jobs
    /// come back as `Upload` and `Cancelled` errors.
    pub async fn wait_for_result(&self, job_id: &str) -> Result<UploadResult> {
        self.wait_for_job(job_id).await?.outcome()
    }

    /// Cancel a job that hasn't finished. Terminal jobs are left untouched.
    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.registry.cancel(job_id)
    }

    /// Remove the job and its listeners. Safe for unknown ids.
    pub fn cleanup_job(&self, job_id: &str) {
        self.registry.cleanup(job_id)
    }
}
