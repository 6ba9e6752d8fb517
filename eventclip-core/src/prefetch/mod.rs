//! Windowed video prefetch cache.

pub mod fetcher;
pub mod scheduler;
pub mod store;
pub mod window;

pub use fetcher::{HttpVideoFetcher, VideoDescriptor, VideoFetcher};
pub use scheduler::PrefetchScheduler;
pub use store::{CacheStats, CachedVideo, VideoCacheStore};
pub use window::{keep_range, prefetch_range};
