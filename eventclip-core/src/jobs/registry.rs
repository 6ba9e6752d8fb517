//! In-memory upload job registry.
//!
//! Each job lives in a [`JobSlot`] holding its snapshot, listeners, and
//! cancellation token. All status/progress changes go through
//! [`JobSlot::apply`], which enforces the state machine, ignores mutations
//! on terminal or removed jobs, and delivers notifications in order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{JobStatus, UploadJob, UploadResult};
use super::pipeline::{ProgressReporter, ProgressSignal, TransferPipeline, TransferRequest};
use crate::events::{JobEvent, JobEventBroadcaster, ListenerSet, Subscription};
use crate::{Error, Result};

/// Callback receiving the latest percentage on every progress tick.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// A requested change to a job.
#[derive(Debug, Clone)]
enum Mutation {
    Transition(JobStatus),
    Progress(u8),
    Complete(UploadResult),
    Fail(String),
    Cancel,
}

/// What [`JobSlot::apply`] did with a mutation.
#[derive(Debug)]
enum Applied {
    /// State changed and listeners were notified.
    Changed(UploadJob),
    /// Job is live but the mutation changed nothing (e.g. repeated percentage).
    Unchanged(UploadJob),
    /// Job is terminal or removed, or the transition isn't an edge.
    Ignored,
}

struct JobSlot {
    job: Mutex<UploadJob>,
    listeners: ListenerSet<UploadJob>,
    /// Held across mutate + notify so one job's notifications never reorder.
    /// Reentrant so listeners may call back into the registry.
    delivery: ReentrantMutex<()>,
    /// Woken on terminal transitions and on removal.
    settled: Notify,
    cancel: CancellationToken,
    removed: AtomicBool,
}

impl JobSlot {
    fn new(job: UploadJob) -> Self {
        Self {
            job: Mutex::new(job),
            listeners: ListenerSet::new(),
            delivery: ReentrantMutex::new(()),
            settled: Notify::new(),
            cancel: CancellationToken::new(),
            removed: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> UploadJob {
        self.job.lock().clone()
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// The single place where a job's state changes.
    fn apply(&self, mutation: Mutation, events: &JobEventBroadcaster) -> Applied {
        let _delivery = self.delivery.lock();
        if self.is_removed() {
            return Applied::Ignored;
        }

        let snapshot = {
            let mut job = self.job.lock();
            if job.status.is_terminal() {
                return Applied::Ignored;
            }

            match mutation {
                Mutation::Transition(next) => {
                    if !job.status.can_transition_to(next) {
                        return Applied::Ignored;
                    }
                    job.status = next;
                }
                Mutation::Progress(percent) => {
                    if !job.status.accepts_progress() {
                        return Applied::Ignored;
                    }
                    let percent = percent.min(100);
                    if percent <= job.progress {
                        return Applied::Unchanged(job.clone());
                    }
                    job.progress = percent;
                }
                Mutation::Complete(result) => {
                    if job.status != JobStatus::Uploading {
                        return Applied::Ignored;
                    }
                    job.progress = 100;
                    job.status = JobStatus::Uploaded;
                    job.result = Some(result);
                }
                Mutation::Fail(message) => {
                    job.status = JobStatus::Error;
                    job.error = Some(message);
                }
                Mutation::Cancel => {
                    job.status = JobStatus::Cancelled;
                }
            }

            job.updated_at = Utc::now();
            job.clone()
        };

        events.publish(JobEvent {
            job_id: snapshot.id.clone(),
            status: snapshot.status,
            progress: snapshot.progress,
            at: snapshot.updated_at,
        });
        self.listeners.emit(&snapshot);
        if snapshot.is_terminal() {
            self.settled.notify_waiters();
        }

        Applied::Changed(snapshot)
    }

    /// Detach the slot from the registry. Later mutations become no-ops.
    fn mark_removed(&self) {
        let _delivery = self.delivery.lock();
        self.removed.store(true, Ordering::Release);
        self.listeners.clear();
        self.cancel.cancel();
        self.settled.notify_waiters();
    }
}

/// Registry of upload jobs for the lifetime of the process.
///
/// Jobs are only removed by [`cleanup`](Self::cleanup).
pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobSlot>>,
    events: JobEventBroadcaster,
}

impl JobRegistry {
    pub fn new(events: JobEventBroadcaster) -> Self {
        Self {
            jobs: DashMap::new(),
            events,
        }
    }

    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }

    fn slot(&self, id: &str) -> Result<Arc<JobSlot>> {
        self.jobs
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::not_found("UploadJob", id))
    }

    /// Register a freshly created job and return its id.
    pub fn insert(&self, job: UploadJob) -> String {
        let id = job.id.clone();
        debug!(job_id = %id, media_type = %job.media_type, "Registered upload job");
        self.jobs.insert(id.clone(), Arc::new(JobSlot::new(job)));
        id
    }

    pub fn get(&self, id: &str) -> Option<UploadJob> {
        self.jobs.get(id).map(|entry| entry.value().snapshot())
    }

    /// Snapshots of every registered job, oldest first.
    pub fn list(&self) -> Vec<UploadJob> {
        let mut jobs: Vec<UploadJob> = self
            .jobs
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// True when there is nothing to wait for: unknown job, or uploaded.
    pub fn is_ready(&self, id: &str) -> bool {
        match self.jobs.get(id) {
            Some(entry) => entry.value().job.lock().status == JobStatus::Uploaded,
            None => true,
        }
    }

    /// Register a listener for every later mutation of the job.
    pub fn subscribe<F>(&self, id: &str, listener: F) -> Result<Subscription>
    where
        F: Fn(&UploadJob) + Send + Sync + 'static,
    {
        let slot = self.slot(id)?;
        Ok(slot.listeners.add(listener))
    }

    /// Move the job to `processing` and run `pipeline` on a background task.
    ///
    /// Must be called from within a tokio runtime. Rejects jobs that are not
    /// in `created`, which also makes a second start on the same job fail.
    pub fn start(
        &self,
        id: &str,
        pipeline: Arc<dyn TransferPipeline>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let slot = self.slot(id)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("no tokio runtime to run upload: {e}")))?;

        let job = match slot.apply(Mutation::Transition(JobStatus::Processing), &self.events) {
            Applied::Changed(job) => job,
            _ => {
                return Err(Error::InvalidStateTransition {
                    from: slot.snapshot().status.to_string(),
                    to: JobStatus::Processing.to_string(),
                });
            }
        };
        info!(job_id = %id, source = %job.source_uri, "Upload started");

        let request = TransferRequest {
            job_id: job.id.clone(),
            source_uri: job.source_uri.clone(),
            user_id: job.user_id.clone(),
            media_type: job.media_type,
            options: job.options.clone(),
        };
        let reporter = {
            let slot = Arc::clone(&slot);
            let events = self.events.clone();
            ProgressReporter::new(id, slot.cancel.clone(), move |signal| {
                handle_signal(&slot, &events, signal, on_progress.as_ref());
            })
        };

        let events = self.events.clone();
        runtime.spawn(async move {
            let outcome = AssertUnwindSafe(pipeline.transfer(request, reporter))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::upload("transfer pipeline panicked")));
            finish(&slot, &events, outcome);
        });

        Ok(())
    }

    /// Cancel a running job. A no-op for terminal jobs.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        match slot.apply(Mutation::Cancel, &self.events) {
            Applied::Changed(_) => {
                slot.cancel.cancel();
                info!(job_id = %id, "Upload cancelled");
            }
            _ => debug!(job_id = %id, "Cancel ignored for finished job"),
        }
        Ok(())
    }

    /// Remove the job and its listeners. Unknown ids are ignored.
    pub fn cleanup(&self, id: &str) {
        if let Some((_, slot)) = self.jobs.remove(id) {
            slot.mark_removed();
            debug!(job_id = %id, "Upload job cleaned up");
        }
    }

    /// Wait until the job is terminal.
    ///
    /// Timing out does not affect the job. Fails with `NotFound` if the job is
    /// unknown or gets cleaned up while waiting.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<UploadJob> {
        let slot = self.slot(id)?;

        let settled = async {
            loop {
                let notified = slot.settled.notified();
                if slot.is_removed() {
                    return Err(Error::not_found("UploadJob", id));
                }
                let job = slot.snapshot();
                if job.is_terminal() {
                    return Ok(job);
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, settled).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                debug!(job_id = %id, timeout_ms, "Wait for job timed out");
                Err(Error::Timeout {
                    id: id.to_string(),
                    timeout_ms,
                })
            }
        }
    }
}

fn handle_signal(
    slot: &JobSlot,
    events: &JobEventBroadcaster,
    signal: ProgressSignal,
    on_progress: Option<&ProgressCallback>,
) {
    match signal {
        ProgressSignal::Percent(percent) => {
            match slot.apply(Mutation::Progress(percent), events) {
                Applied::Changed(job) | Applied::Unchanged(job) => {
                    if let Some(callback) = on_progress {
                        callback(job.progress);
                    }
                }
                Applied::Ignored => {}
            }
        }
        ProgressSignal::UploadStage => {
            slot.apply(Mutation::Transition(JobStatus::Uploading), events);
        }
    }
}

/// Apply the pipeline outcome. Late results for cancelled or removed jobs are dropped.
fn finish(slot: &JobSlot, events: &JobEventBroadcaster, outcome: Result<UploadResult>) {
    let job_id = slot.snapshot().id;

    match outcome {
        Ok(result) => {
            // Walk every remaining edge so listeners never see a skipped state.
            slot.apply(Mutation::Transition(JobStatus::Uploading), events);
            slot.apply(Mutation::Progress(100), events);
            match slot.apply(Mutation::Complete(result), events) {
                Applied::Changed(_) => info!(job_id = %job_id, "Upload finished"),
                _ => debug!(job_id = %job_id, "Ignoring pipeline result for finished job"),
            }
        }
        Err(Error::Cancelled { .. }) => {
            slot.apply(Mutation::Cancel, events);
        }
        Err(err) => {
            let message = match err {
                Error::Upload(message) => message,
                other => other.to_string(),
            };
            match slot.apply(Mutation::Fail(message.clone()), events) {
                Applied::Changed(_) => warn!(job_id = %job_id, error = %message, "Upload failed"),
                _ => debug!(job_id = %job_id, error = %message, "Ignoring pipeline error for finished job"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{MediaType, TransformOptions};
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    fn new_job() -> UploadJob {
        UploadJob::new(
            "file://clip.mp4".into(),
            "u1".into(),
            MediaType::Video,
            TransformOptions::default(),
        )
    }

    fn registry() -> JobRegistry {
        JobRegistry::new(JobEventBroadcaster::with_capacity(64))
    }

    /// Pipeline that blocks until released, then returns the given outcome.
    struct GatedPipeline {
        gate: Mutex<Option<oneshot::Receiver<Result<UploadResult>>>>,
    }

    impl GatedPipeline {
        fn new() -> (Arc<Self>, oneshot::Sender<Result<UploadResult>>) {
            let (tx, rx) = oneshot::channel();
            (
                Arc::new(Self {
                    gate: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl TransferPipeline for GatedPipeline {
        async fn transfer(
            &self,
            _request: TransferRequest,
            reporter: ProgressReporter,
        ) -> Result<UploadResult> {
            reporter.report(10);
            let gate = self.gate.lock().take();
            match gate {
                Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::upload("gate dropped"))),
                None => Err(Error::upload("pipeline reused")),
            }
        }
    }

    #[test]
    fn test_apply_ignores_terminal_jobs() {
        let events = JobEventBroadcaster::with_capacity(8);
        let slot = JobSlot::new(new_job());

        assert!(matches!(
            slot.apply(Mutation::Transition(JobStatus::Processing), &events),
            Applied::Changed(_)
        ));
        assert!(matches!(
            slot.apply(Mutation::Cancel, &events),
            Applied::Changed(_)
        ));
        assert!(matches!(
            slot.apply(Mutation::Progress(50), &events),
            Applied::Ignored
        ));
        assert!(matches!(
            slot.apply(Mutation::Fail("late".into()), &events),
            Applied::Ignored
        ));
        let job = slot.snapshot();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_progress_is_monotonic_and_requires_running_status() {
        let events = JobEventBroadcaster::with_capacity(8);
        let slot = JobSlot::new(new_job());

        assert!(matches!(
            slot.apply(Mutation::Progress(10), &events),
            Applied::Ignored
        ));
        slot.apply(Mutation::Transition(JobStatus::Processing), &events);
        slot.apply(Mutation::Progress(40), &events);
        assert!(matches!(
            slot.apply(Mutation::Progress(20), &events),
            Applied::Unchanged(_)
        ));
        assert_eq!(slot.snapshot().progress, 40);
    }

    #[test]
    fn test_removed_slot_ignores_mutations() {
        let events = JobEventBroadcaster::with_capacity(8);
        let slot = JobSlot::new(new_job());
        slot.mark_removed();
        assert!(matches!(
            slot.apply(Mutation::Transition(JobStatus::Processing), &events),
            Applied::Ignored
        ));
        assert!(slot.cancel.is_cancelled());
    }

    #[test]
    fn test_is_ready_for_unknown_job() {
        let registry = registry();
        assert!(registry.is_ready("missing"));
        let id = registry.insert(new_job());
        assert!(!registry.is_ready(&id));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let registry = registry();
        let id = registry.insert(new_job());
        let (pipeline, release) = GatedPipeline::new();

        registry.start(&id, pipeline.clone(), None).unwrap();
        let err = registry.start(&id, pipeline, None).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        release.send(Ok(UploadResult::video("videos/x.mp4"))).unwrap();
        let job = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_cleanup_during_flight_is_silent() {
        let registry = registry();
        let id = registry.insert(new_job());
        let (pipeline, release) = GatedPipeline::new();
        registry.start(&id, pipeline, None).unwrap();

        registry.cleanup(&id);
        registry.cleanup(&id);
        assert!(registry.get(&id).is_none());

        // Completion after removal must not panic or resurrect the job.
        let _ = release.send(Ok(UploadResult::video("videos/x.mp4")));
        tokio::task::yield_now().await;
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_fails_when_job_cleaned_up() {
        let registry = Arc::new(registry());
        let id = registry.insert(new_job());

        let waiter = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.wait(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        registry.cleanup(&id);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_pipeline_error_captured_verbatim() {
        let registry = registry();
        let id = registry.insert(new_job());
        let (pipeline, release) = GatedPipeline::new();
        registry.start(&id, pipeline, None).unwrap();

        release.send(Err(Error::upload("storage quota exceeded"))).unwrap();
        let job = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("storage quota exceeded"));
        assert_eq!(job.progress, 10);
        assert!(job.result.is_none());
    }
}
