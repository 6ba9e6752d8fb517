//! Background upload jobs.

pub mod coordinator;
pub mod model;
pub mod pipeline;
pub mod registry;

pub use coordinator::JobCoordinator;
pub use model::{JobStatus, MediaType, TransformOptions, TrimRange, UploadJob, UploadResult};
pub use pipeline::{
    MediaTransform, ProgressReporter, ProgressSignal, StagedPipeline, StorageUploader,
    TransferPipeline, TransferRequest, TransformedMedia,
};
pub use registry::{JobRegistry, ProgressCallback};
