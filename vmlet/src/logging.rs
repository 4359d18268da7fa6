//! Tracing setup: stderr plus a non-blocking file under `<home>/logs/`.
//!
//! The filter comes from `RUST_LOG` and defaults to `info`. Keep the returned
//! guard alive until exit so buffered lines reach the file.

use crate::errors::{VmletError, VmletResult};
use crate::runtime::FilesystemLayout;
use crate::runtime::layout::filenames;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

pub fn init_logging_for(layout: &FilesystemLayout) -> VmletResult<WorkerGuard> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .map_err(|e| VmletError::staging("create logs directory", &logs_dir, e))?;

    let file_appender = tracing_appender::rolling::never(&logs_dir, filenames::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .map_err(|e| VmletError::Internal(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}
