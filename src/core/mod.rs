//! Ambient stack shared by every subsystem: configuration, error types,
//! and logging.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    get_config, get_data_dir, init_config, load_config, save_config, MonitorConfig,
};
pub use error::{ErrorCategory, MonitorError, Result};
pub use logging::{initialize_default_logging, initialize_logging, LoggingConfig, PerfTimer};
