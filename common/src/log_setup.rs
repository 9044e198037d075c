use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "spotfit";
const MAX_LOG_FILES: usize = 5;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("Invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },
    #[error("Failed to create log directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to create log file appender: {0}")]
    Appender(String),
    #[error("Logging already initialized")]
    AlreadyInitialized,
}

/// Installs console + daily rolling file logging under `logs/`.
///
/// `RUST_LOG` takes precedence over `base_level`. Panics if logging cannot be
/// set up; use [`try_setup_logging`] to handle the failure instead.
pub fn setup_logging(base_level: &str) {
    try_setup_logging(Path::new(LOG_DIR), base_level)
        .unwrap_or_else(|e| panic!("Logger initialization failed: {}", e));
}

pub fn try_setup_logging(log_dir: &Path, base_level: &str) -> Result<(), LogSetupError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(base_level)?,
    };

    std::fs::create_dir_all(log_dir).map_err(|source| LogSetupError::CreateDir {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .map_err(|e| LogSetupError::Appender(e.to_string()))?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| LogSetupError::AlreadyInitialized)?;

    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(true)
        .with_writer(console_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogSetupError::AlreadyInitialized)
}

fn parse_filter(directives: &str) -> Result<EnvFilter, LogSetupError> {
    EnvFilter::try_new(directives).map_err(|e| LogSetupError::Filter {
        filter: directives.to_string(),
        message: e.to_string(),
    })
}

/// Console-only logging routed through the test harness capture.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}
