//! eventclip-core library crate.
//!
//! Background upload jobs that outlive the screen that started them, and a
//! windowed prefetch cache for the vertical video feed.

pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod prefetch;
pub mod services;

pub use error::{Error, Result};
