//! Structured logging infrastructure for the monitoring control plane.
//!
//! - Console logging with colors when attached to a tty
//! - File logging with daily rotation
//! - Structured JSON logging for downstream log ingestion
//! - Performance timing helpers for hot loops (evaluator ticks, dispatch)

use is_terminal::IsTerminal;
use std::fs;
use std::path::PathBuf;
use std::sync::Once;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::core::error::{MonitorError, Result};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub console_level: Level,
    pub file_level: Level,
    pub json_level: Level,
    pub log_dir: PathBuf,
    pub console_colors: bool,
    pub file_logging: bool,
    pub json_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let log_dir = crate::core::config::get_data_dir().join("logs");

        Self {
            console_level: Level::INFO,
            file_level: Level::DEBUG,
            json_level: Level::WARN,
            log_dir,
            console_colors: true,
            file_logging: true,
            json_logging: true,
        }
    }
}

static LOGGING_INITIALIZED: Once = Once::new();

/// Initialize the logging system. Safe to call more than once — only the
/// first call takes effect.
pub fn initialize_logging(config: LoggingConfig) -> Result<()> {
    LOGGING_INITIALIZED.call_once(|| {
        if let Err(e) = setup_logging_internal(config) {
            eprintln!("Failed to initialize logging: {e}");
        }
    });
    Ok(())
}

/// Initialize logging with default configuration.
pub fn initialize_default_logging() -> Result<()> {
    initialize_logging(LoggingConfig::default())
}

fn setup_logging_internal(config: LoggingConfig) -> Result<()> {
    if config.file_logging || config.json_logging {
        fs::create_dir_all(&config.log_dir).map_err(|_| MonitorError::ConfigDirCreation {
            path: config.log_dir.clone(),
        })?;
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.console_level.into())
        .from_env_lossy()
        .add_directive("monitor_core=trace".parse().unwrap())
        .add_directive("hyper=info".parse().unwrap())
        .add_directive("reqwest=info".parse().unwrap());

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer = fmt::layer()
        .with_ansi(config.console_colors && std::io::stdout().is_terminal())
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stdout)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            config.console_level,
        ));

    let mut layers = vec![Box::new(console_layer) as Box<dyn Layer<_> + Send + Sync>];

    if config.file_logging {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "monitor-core.log");

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::FULL)
            .with_writer(file_appender)
            .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                config.file_level,
            ));

        layers.push(Box::new(file_layer));
    }

    if config.json_logging {
        let json_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "monitor-core.jsonl");

        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(json_appender)
            .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                config.json_level,
            ));

        layers.push(Box::new(json_layer));
    }

    registry.with(layers).try_init().map_err(|e| {
        MonitorError::internal("logging", format!("Failed to initialize tracing: {e}"))
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %config.log_dir.display(),
        "monitor-core logging initialized"
    );

    Ok(())
}

/// Simple timing helper for bounding evaluator ticks and dispatch rounds.
pub struct PerfTimer {
    name: String,
    start: std::time::Instant,
}

impl PerfTimer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: std::time::Instant::now(),
        }
    }

    pub fn finish(self) {
        let elapsed = self.start.elapsed();
        tracing::debug!(operation = %self.name, elapsed_ms = elapsed.as_millis() as u64, "operation finished");
    }
}
