//! Modbus RTU master/slave utility
//!
//! Talks to devices over a half-duplex serial link, either as the master
//! issuing holding register reads and single register writes, or as a slave
//! that answers those requests from an in-memory register bank.

pub mod cli;
pub mod config;
pub mod modbus;
pub mod output;
pub mod utils;

// Re-export commonly used types
pub use config::{DeviceConfig, ParityConfig, Role, SessionStore, StopBitsConfig};
pub use modbus::{
    crc16_modbus, MasterOptions, MemoryTransport, ModbusMaster, ModbusSlave, RegisterBank,
    ResponseMode, SerialTransport, Transport,
};
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
