pub mod error;
pub mod logging;

pub use error::ModbusError;
pub use logging::{init_logging, DEFAULT_LOG_FILE};
