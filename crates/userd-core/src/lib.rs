//! Core configuration and utilities for the userd service.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DEFAULT_EVENT_STREAM, DEFAULT_LOG_LEVEL, DEFAULT_REDIS_URL};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
