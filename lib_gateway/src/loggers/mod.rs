/// Tracing subscriber bootstrap with daily files and retention cleanup.
pub mod tracing_setup;

pub use tracing_setup::{cleanup_old_logs, setup_logging, LogSettings, LoggerError};
