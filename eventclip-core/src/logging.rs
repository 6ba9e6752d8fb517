//! Tracing setup for the host application.
//!
//! The host (the mobile shell embedding this crate) calls [`init_logging`]
//! once at startup. Verbosity can be changed later through the returned
//! [`LoggingHandle`] without reinstalling the subscriber.

use std::path::PathBuf;

use chrono::Local;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "eventclip_core=info,reqwest=warn,hyper=warn";

/// File name prefix for the rolling log file.
const LOG_FILE_PREFIX: &str = "eventclip.log";

/// RFC 3339 timestamp with milliseconds and the device's UTC offset.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Stamps log lines with device-local time, so uploads and prefetches line up
/// with what the user saw on screen.
#[derive(Debug, Clone, Copy, Default)]
struct DeviceClock;

impl FormatTime for DeviceClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format(TIMESTAMP_FORMAT))
    }
}

pub type FilterHandle = Handle<EnvFilter, Registry>;

/// Options for [`init_logging`].
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Directory for daily-rolling log files. Console only when `None`.
    pub log_dir: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is unset. Falls back to [`DEFAULT_LOG_FILTER`].
    pub filter: Option<String>,
    /// Emit ANSI colours on the console layer.
    pub ansi: bool,
}

/// Handle to the installed subscriber's filter.
pub struct LoggingHandle {
    handle: FilterHandle,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Directive string of the filter currently installed.
    ///
    /// Empty if the subscriber has been torn down.
    pub fn get_filter(&self) -> String {
        match self.handle.with_current(ToString::to_string) {
            Ok(directive) => directive,
            Err(_) => String::new(),
        }
    }

    /// Swap the active filter, e.g. to turn on `eventclip_core::prefetch=debug`
    /// while chasing a stalled feed.
    ///
    /// # Arguments
    ///
    /// * `directive` - an `EnvFilter` directive such as `"eventclip_core=debug"`
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the directive doesn't parse and
    /// `Error::Other` if the subscriber is gone. The old filter stays in place
    /// in both cases.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let filter = EnvFilter::try_new(directive).map_err(|e| {
            crate::Error::validation(format!("log filter {directive:?} is invalid: {e}"))
        })?;
        self.handle
            .reload(filter)
            .map_err(|e| crate::Error::Other(format!("log subscriber unavailable: {e}")))?;

        info!(directive, "Log filter changed");
        Ok(())
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already set. The returned handle owns the
/// file writer guard; dropping it flushes and stops file logging.
pub fn init_logging(options: LoggingOptions) -> crate::Result<LoggingHandle> {
    let fallback = options.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let (filter_layer, handle) = reload::Layer::new(initial_filter);

    let console = fmt::layer()
        .with_ansi(options.ansi)
        .with_target(true)
        .with_timer(DeviceClock);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(DeviceClock)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(LoggingHandle {
        handle,
        _guard: guard,
    })
}
