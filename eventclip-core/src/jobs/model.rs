//! Upload job data model and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind of captured media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Photo => write!(f, "photo"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

/// Job status.
///
/// ```text
/// created -> processing -> uploading -> uploaded
///    \            \            \
///     +------------+------------+--> error | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Registered, no work started.
    Created,
    /// Local transform (compression, thumbnailing) in progress.
    Processing,
    /// Bytes are being sent to storage.
    Uploading,
    /// Remote paths are available in the job result.
    Uploaded,
    /// The pipeline failed; the message is in the job error.
    Error,
    /// Cancelled by a caller.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Uploaded | Self::Error | Self::Cancelled)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Created, Processing) | (Processing, Uploading) | (Uploading, Uploaded) => true,
            (Created | Processing | Uploading, Error | Cancelled) => true,
            _ => false,
        }
    }

    /// Whether progress ticks are accepted in this status.
    pub fn accepts_progress(self) -> bool {
        matches!(self, Self::Processing | Self::Uploading)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trim range in seconds, applied to videos before upload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Free-form transform parameters forwarded to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformOptions {
    /// Compression quality in `[0, 1]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimRange>,
    /// Target aspect ratio, e.g. `"9:16"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    /// Anything else the transform understands.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl TransformOptions {
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_trim(mut self, start_secs: f64, end_secs: f64) -> Self {
        self.trim = Some(TrimRange {
            start_secs,
            end_secs,
        });
        self
    }

    pub fn with_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(ratio.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(q) = self.quality
            && !(0.0..=1.0).contains(&q)
        {
            return Err(Error::validation(format!(
                "quality must be within [0, 1], got {q}"
            )));
        }
        if let Some(trim) = self.trim
            && (trim.start_secs < 0.0 || trim.start_secs >= trim.end_secs)
        {
            return Err(Error::validation(format!(
                "invalid trim range {}..{}",
                trim.start_secs, trim.end_secs
            )));
        }
        Ok(())
    }
}

/// Remote storage paths produced by a successful upload.
///
/// Photos fill `image_path`; videos fill `video_path`. Both usually carry a
/// `thumbnail_path`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
}

impl UploadResult {
    pub fn video(path: impl Into<String>) -> Self {
        Self {
            video_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn image(path: impl Into<String>) -> Self {
        Self {
            image_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_thumbnail(mut self, path: impl Into<String>) -> Self {
        self.thumbnail_path = Some(path.into());
        self
    }

    /// The path of the primary asset for the given media type.
    pub fn primary_path(&self, media_type: MediaType) -> Option<&str> {
        match media_type {
            MediaType::Photo => self.image_path.as_deref(),
            MediaType::Video => self.video_path.as_deref(),
        }
    }
}

/// Snapshot of an upload job.
///
/// `result` is only set when `status` is `Uploaded`, `error` only when it is
/// `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: String,
    pub source_uri: String,
    pub user_id: String,
    pub media_type: MediaType,
    pub options: TransformOptions,
    pub status: JobStatus,
    /// 0-100, non-decreasing while the job runs and frozen once terminal.
    pub progress: u8,
    pub result: Option<UploadResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadJob {
    pub(crate) fn new(
        source_uri: String,
        user_id: String,
        media_type: MediaType,
        options: TransformOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_uri,
            user_id,
            media_type,
            options,
            status: JobStatus::Created,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Turn a finished job into the upload outcome.
    ///
    /// Returns `Error::InvalidStateTransition` if the job hasn't finished.
    pub fn outcome(&self) -> Result<UploadResult> {
        match self.status {
            JobStatus::Uploaded => Ok(self.result.clone().unwrap_or_default()),
            JobStatus::Error => Err(Error::upload(
                self.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            )),
            JobStatus::Cancelled => Err(Error::Cancelled {
                id: self.id.clone(),
            }),
            status => Err(Error::InvalidStateTransition {
                from: status.to_string(),
                to: "terminal".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use JobStatus::*;
        assert!(Created.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Uploaded));
        assert!(Created.can_transition_to(Cancelled));
        assert!(Uploading.can_transition_to(Error));

        assert!(!Created.can_transition_to(Uploading));
        assert!(!Processing.can_transition_to(Uploaded));
        for terminal in [Uploaded, Error, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Created, Processing, Uploading, Uploaded, Error, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_new_job_defaults() {
        let job = UploadJob::new(
            "file://clip.mp4".into(),
            "u1".into(),
            MediaType::Video,
            TransformOptions::default().with_quality(0.8),
        );
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(!job.id.is_empty());
    }

    #[test]
    fn test_options_validation() {
        assert!(TransformOptions::default().validate().is_ok());
        assert!(
            TransformOptions::default()
                .with_quality(1.5)
                .validate()
                .is_err()
        );
        assert!(
            TransformOptions::default()
                .with_trim(5.0, 2.0)
                .validate()
                .is_err()
        );
        assert!(
            TransformOptions::default()
                .with_trim(0.0, 15.0)
                .with_aspect_ratio("9:16")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Uploaded).unwrap();
        assert_eq!(json, "\"uploaded\"");
        let media: MediaType = serde_json::from_str("\"photo\"").unwrap();
        assert_eq!(media, MediaType::Photo);
    }

    #[test]
    fn test_outcome_mapping() {
        let mut job = UploadJob::new(
            "file://a.jpg".into(),
            "u1".into(),
            MediaType::Photo,
            TransformOptions::default(),
        );
        assert!(matches!(
            job.outcome(),
            Err(Error::InvalidStateTransition { .. })
        ));

        job.status = JobStatus::Error;
        job.error = Some("403 Forbidden".into());
        match job.outcome() {
            Err(Error::Upload(msg)) => assert_eq!(msg, "403 Forbidden"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        job.status = JobStatus::Uploaded;
        job.error = None;
        job.result = Some(UploadResult::image("images/a.jpg"));
        let result = job.outcome().unwrap();
        assert_eq!(result.primary_path(MediaType::Photo), Some("images/a.jpg"));
    }
}
