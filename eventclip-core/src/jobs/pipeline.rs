//! Transfer pipeline seam.
//!
//! The registry drives one [`TransferPipeline`] call per job. The pipeline
//! reports progress through a [`ProgressReporter`] and observes cancellation
//! through the same handle. [`StagedPipeline`] is a ready-made pipeline that
//! chains an opaque local transform with a storage upload.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::model::{MediaType, TransformOptions, UploadResult};
use crate::{Error, Result};

/// Everything the pipeline needs to know about one job.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub job_id: String,
    pub source_uri: String,
    pub user_id: String,
    pub media_type: MediaType,
    pub options: TransformOptions,
}

/// Signals a pipeline sends back to the job registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSignal {
    /// Percentage in `0..=100`.
    Percent(u8),
    /// Local processing finished; bytes are about to be sent.
    UploadStage,
}

type SignalSink = Arc<dyn Fn(ProgressSignal) + Send + Sync>;

/// Handle passed to the pipeline for progress reporting and cancellation.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    sink: SignalSink,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<String>,
        cancel: CancellationToken,
        sink: impl Fn(ProgressSignal) + Send + Sync + 'static,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            sink: Arc::new(sink),
            cancel,
        }
    }

    /// A reporter that discards everything.
    pub fn noop(job_id: impl Into<String>) -> Self {
        Self::new(job_id, CancellationToken::new(), |_| {})
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Report a percentage. Values above 100 are clamped.
    pub fn report(&self, percent: u8) {
        (self.sink)(ProgressSignal::Percent(percent.min(100)));
    }

    /// Move the job from `processing` to `uploading`.
    pub fn enter_upload_stage(&self) {
        (self.sink)(ProgressSignal::UploadStage);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fail with `Error::Cancelled` if the job was cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled {
                id: self.job_id.clone(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Transforms and uploads one piece of local media.
///
/// Implementations should stop early when `reporter.is_cancelled()` turns
/// true, but the registry ignores whatever they return after a cancellation
/// anyway.
#[async_trait]
pub trait TransferPipeline: Send + Sync {
    async fn transfer(
        &self,
        request: TransferRequest,
        reporter: ProgressReporter,
    ) -> Result<UploadResult>;
}

/// Output of the local transform step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedMedia {
    /// Local URI of the compressed/trimmed asset.
    pub media_uri: String,
    /// Local URI of the generated thumbnail, if any.
    pub thumbnail_uri: Option<String>,
}

/// Opaque local media transform (compression, trimming, thumbnailing).
#[async_trait]
pub trait MediaTransform: Send + Sync {
    async fn transform(
        &self,
        request: &TransferRequest,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<TransformedMedia>;
}

/// Storage backend receiving uploaded bytes.
#[async_trait]
pub trait StorageUploader: Send + Sync {
    /// Upload `local_uri` to `remote_path` and return the stored path.
    async fn upload(
        &self,
        local_uri: &str,
        remote_path: &str,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<String>;
}

/// Percentage split between the transform and upload stages.
const TRANSFORM_SHARE: u8 = 50;
const PRIMARY_UPLOAD_END: u8 = 90;

/// Pipeline that runs a [`MediaTransform`] then uploads through a [`StorageUploader`].
///
/// Remote layout: `videos/{job_id}.mp4`, `images/{job_id}.jpg` and
/// `thumbnails/{job_id}.jpg`.
pub struct StagedPipeline<T, U> {
    transform: T,
    uploader: U,
}

impl<T, U> StagedPipeline<T, U>
where
    T: MediaTransform,
    U: StorageUploader,
{
    pub fn new(transform: T, uploader: U) -> Self {
        Self {
            transform,
            uploader,
        }
    }

    pub fn remote_media_path(job_id: &str, media_type: MediaType) -> String {
        match media_type {
            MediaType::Video => format!("videos/{job_id}.mp4"),
            MediaType::Photo => format!("images/{job_id}.jpg"),
        }
    }

    pub fn remote_thumbnail_path(job_id: &str) -> String {
        format!("thumbnails/{job_id}.jpg")
    }
}

#[async_trait]
impl<T, U> TransferPipeline for StagedPipeline<T, U>
where
    T: MediaTransform,
    U: StorageUploader,
{
    async fn transfer(
        &self,
        request: TransferRequest,
        reporter: ProgressReporter,
    ) -> Result<UploadResult> {
        reporter.report(0);

        let transformed = {
            let on_progress = |p: u8| reporter.report(scale(p, 0, TRANSFORM_SHARE));
            self.transform.transform(&request, &on_progress).await?
        };
        reporter.check_cancelled()?;
        debug!(job_id = %request.job_id, media = %transformed.media_uri, "Transform finished");

        reporter.enter_upload_stage();
        reporter.report(TRANSFORM_SHARE);

        let primary_end = if transformed.thumbnail_uri.is_some() {
            PRIMARY_UPLOAD_END
        } else {
            100
        };
        let remote = Self::remote_media_path(&request.job_id, request.media_type);
        let stored = {
            let on_progress = |p: u8| reporter.report(scale(p, TRANSFORM_SHARE, primary_end));
            self.uploader
                .upload(&transformed.media_uri, &remote, &on_progress)
                .await?
        };

        let mut result = match request.media_type {
            MediaType::Video => UploadResult::video(stored),
            MediaType::Photo => UploadResult::image(stored),
        };

        if let Some(thumbnail) = &transformed.thumbnail_uri {
            reporter.check_cancelled()?;
            let remote = Self::remote_thumbnail_path(&request.job_id);
            let on_progress = |p: u8| reporter.report(scale(p, primary_end, 100));
            let stored = self
                .uploader
                .upload(thumbnail, &remote, &on_progress)
                .await?;
            result.thumbnail_path = Some(stored);
        }

        reporter.report(100);
        Ok(result)
    }
}

/// Map `percent` (0-100) into `lo..=hi`.
fn scale(percent: u8, lo: u8, hi: u8) -> u8 {
    let span = u16::from(hi.saturating_sub(lo));
    lo + (u16::from(percent.min(100)) * span / 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeTransform {
        thumbnail: bool,
    }

    #[async_trait]
    impl MediaTransform for FakeTransform {
        async fn transform(
            &self,
            request: &TransferRequest,
            progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<TransformedMedia> {
            progress(50);
            progress(100);
            Ok(TransformedMedia {
                media_uri: format!("{}.compressed", request.source_uri),
                thumbnail_uri: self.thumbnail.then(|| "file://thumb.jpg".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StorageUploader for RecordingUploader {
        async fn upload(
            &self,
            local_uri: &str,
            remote_path: &str,
            progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<String> {
            progress(100);
            self.uploads
                .lock()
                .push((local_uri.to_string(), remote_path.to_string()));
            Ok(remote_path.to_string())
        }
    }

    fn request(media_type: MediaType) -> TransferRequest {
        TransferRequest {
            job_id: "J1".into(),
            source_uri: "file://clip".into(),
            user_id: "u1".into(),
            media_type,
            options: TransformOptions::default(),
        }
    }

    fn recording_reporter() -> (ProgressReporter, Arc<Mutex<Vec<ProgressSignal>>>) {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = signals.clone();
        let reporter =
            ProgressReporter::new("J1", CancellationToken::new(), move |s| sink.lock().push(s));
        (reporter, signals)
    }

    #[test]
    fn test_scale() {
        assert_eq!(scale(0, 0, 50), 0);
        assert_eq!(scale(100, 0, 50), 50);
        assert_eq!(scale(50, 50, 100), 75);
        assert_eq!(scale(200, 90, 100), 100);
    }

    #[test]
    fn test_reporter_clamps_percent() {
        let (reporter, signals) = recording_reporter();
        reporter.report(250);
        assert_eq!(*signals.lock(), vec![ProgressSignal::Percent(100)]);
    }

    #[tokio::test]
    async fn test_staged_pipeline_video_with_thumbnail() {
        let pipeline = StagedPipeline::new(
            FakeTransform { thumbnail: true },
            RecordingUploader::default(),
        );
        let (reporter, signals) = recording_reporter();

        let result = pipeline
            .transfer(request(MediaType::Video), reporter)
            .await
            .unwrap();

        assert_eq!(result.video_path.as_deref(), Some("videos/J1.mp4"));
        assert_eq!(result.thumbnail_path.as_deref(), Some("thumbnails/J1.jpg"));
        assert!(result.image_path.is_none());

        let signals = signals.lock();
        let stage_at = signals
            .iter()
            .position(|s| *s == ProgressSignal::UploadStage)
            .unwrap();
        assert!(
            signals[..stage_at]
                .iter()
                .all(|s| matches!(s, ProgressSignal::Percent(p) if *p <= TRANSFORM_SHARE))
        );
        assert_eq!(signals.last(), Some(&ProgressSignal::Percent(100)));

        let uploads = pipeline.uploader.uploads.lock();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].0, "file://clip.compressed");
    }

    #[tokio::test]
    async fn test_staged_pipeline_stops_when_cancelled() {
        let pipeline = StagedPipeline::new(
            FakeTransform { thumbnail: false },
            RecordingUploader::default(),
        );
        let token = CancellationToken::new();
        token.cancel();
        let reporter = ProgressReporter::new("J1", token, |_| {});

        let err = pipeline
            .transfer(request(MediaType::Photo), reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(pipeline.uploader.uploads.lock().is_empty());
    }
}
