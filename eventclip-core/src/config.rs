//! Runtime configuration for the job coordinator and the prefetch scheduler.
//!
//! Every struct has a `Default` that matches the behaviour screens expect and a
//! `from_env_or_default()` constructor that applies `EVENTCLIP_*` overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default deadline for `wait_for_job` (30 seconds).
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Default capacity of the process-wide job event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for upload jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Deadline applied by `wait_for_job` when the caller doesn't pass one.
    pub default_wait_timeout_ms: u64,
    /// Capacity of the broadcast channel carrying job events.
    pub event_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl JobsConfig {
    /// Load jobs config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `EVENTCLIP_WAIT_TIMEOUT_MS` (e.g. "45000")
    /// - `EVENTCLIP_EVENT_CAPACITY` (e.g. "512")
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = env_parse::<u64>("EVENTCLIP_WAIT_TIMEOUT_MS") {
            config.default_wait_timeout_ms = timeout;
        }
        if let Some(capacity) = env_parse::<usize>("EVENTCLIP_EVENT_CAPACITY")
            && capacity > 0
        {
            config.event_capacity = capacity;
        }

        config
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }
}

/// Configuration for the windowed video prefetch cache.
///
/// The prefetch window (`behind`/`ahead`) decides what gets downloaded; the
/// keep window (`keep_radius`) decides what survives eviction once the cache
/// holds more than `capacity` entries. The keep window is meant to be wider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Slots behind the current index to prefetch.
    pub behind: usize,
    /// Slots ahead of the current index to prefetch.
    pub ahead: usize,
    /// Slots on each side of the current index tolerated during eviction.
    pub keep_radius: usize,
    /// Entry count above which an eviction pass runs.
    pub capacity: usize,
    /// Maximum fetches started per drain pass.
    pub max_concurrent: usize,
    /// Delay before the next drain pass while the queue is non-empty.
    pub drain_delay_ms: u64,
    /// Directory for downloaded video files.
    pub cache_dir: PathBuf,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            behind: 2,
            ahead: 3,
            keep_radius: 5,
            capacity: 7,
            max_concurrent: 2,
            drain_delay_ms: 100,
            cache_dir: std::env::temp_dir().join("eventclip-videos"),
        }
    }
}

impl PrefetchConfig {
    /// Load prefetch config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `EVENTCLIP_PREFETCH_BEHIND` / `EVENTCLIP_PREFETCH_AHEAD`
    /// - `EVENTCLIP_PREFETCH_KEEP_RADIUS`
    /// - `EVENTCLIP_PREFETCH_CAPACITY`
    /// - `EVENTCLIP_PREFETCH_CONCURRENCY`
    /// - `EVENTCLIP_CACHE_DIR`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("EVENTCLIP_PREFETCH_BEHIND") {
            config.behind = v;
        }
        if let Some(v) = env_parse("EVENTCLIP_PREFETCH_AHEAD") {
            config.ahead = v;
        }
        if let Some(v) = env_parse("EVENTCLIP_PREFETCH_KEEP_RADIUS") {
            config.keep_radius = v;
        }
        if let Some(v) = env_parse("EVENTCLIP_PREFETCH_CAPACITY") {
            config.capacity = v;
        }
        if let Some(v) = env_parse("EVENTCLIP_PREFETCH_CONCURRENCY") {
            config.max_concurrent = v;
        }
        if let Ok(dir) = std::env::var("EVENTCLIP_CACHE_DIR")
            && !dir.trim().is_empty()
        {
            config.cache_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config("prefetch max_concurrent must be > 0"));
        }
        if self.capacity == 0 {
            return Err(Error::config("prefetch capacity must be > 0"));
        }
        Ok(())
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }
}

/// Top-level configuration for the core services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub jobs: JobsConfig,
    pub prefetch: PrefetchConfig,
}

impl CoreConfig {
    /// Load a `.env` file if present, then read every section from the environment.
    pub fn from_env_or_default() -> Self {
        dotenvy::dotenv().ok();
        Self {
            jobs: JobsConfig::from_env_or_default(),
            prefetch: PrefetchConfig::from_env_or_default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_windows_are_two_tier() {
        let config = PrefetchConfig::default();
        assert_eq!(config.behind, 2);
        assert_eq!(config.ahead, 3);
        assert_eq!(config.keep_radius, 5);
        assert_eq!(config.capacity, 7);
        assert_eq!(config.max_concurrent, 2);
        assert!(config.keep_radius > config.ahead.max(config.behind));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = PrefetchConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        assert!(PrefetchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"prefetch":{"capacity":12}}"#).unwrap();
        assert_eq!(config.prefetch.capacity, 12);
        assert_eq!(config.prefetch.keep_radius, 5);
        assert_eq!(config.jobs.default_wait_timeout_ms, DEFAULT_WAIT_TIMEOUT_MS);
    }
}
