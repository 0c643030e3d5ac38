use env_logger::{Env, Target, WriteStyle};
use std::fs::OpenOptions;
use std::path::Path;

use crate::utils::error::ModbusError;

/// Default transaction log, appended to across runs.
pub const DEFAULT_LOG_FILE: &str = "modbus_utility.log";

/// Installs the global logger. With a `log_file` every record is appended to
/// that file, otherwise records go to stderr. `RUST_LOG` overrides
/// `default_level`.
pub fn init_logging(default_level: &str, log_file: Option<&Path>) -> Result<(), ModbusError> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(default_level));
    builder.format_timestamp_millis();

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                ModbusError::ConfigError(format!(
                    "Cannot open log file {}: {}",
                    path.display(),
                    e
                ))
            })?;
        builder
            .target(Target::Pipe(Box::new(file)))
            .write_style(WriteStyle::Never);
    }

    builder
        .try_init()
        .map_err(|e| ModbusError::ConfigError(format!("Logger already initialised: {}", e)))
}
