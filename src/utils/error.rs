use thiserror::Error;

use crate::config::settings::Role;
use crate::modbus::protocol::ExceptionCode;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Failed to open serial link: {0}")]
    LinkOpenError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Incomplete response received: expected {expected} bytes, got {received}")]
    IncompleteFrame { expected: usize, received: usize },

    #[error("Invalid function code received: expected 0x{expected:02X}, got 0x{received:02X}")]
    FunctionCodeMismatch { expected: u8, received: u8 },

    #[error("Byte count mismatch: expected {expected}, got {received}")]
    ByteCountMismatch { expected: usize, received: usize },

    #[error("Error response received: {0}")]
    ExceptionResponse(ExceptionCode),

    #[error("CRC checksum mismatch: calculated 0x{expected:04X}, received 0x{received:04X}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error(
        "Invalid write response: wrote {value} to register {register}, \
         device echoed {echoed_value} at register {echoed_register} (function 0x{echoed_function:02X})"
    )]
    WriteVerification {
        register: u16,
        value: u16,
        echoed_function: u8,
        echoed_register: u16,
        echoed_value: u16,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("No {0} device selected. Use 'info set-device' first")]
    NoSession(Role),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ModbusError {
    /// Errors worth another attempt under a retry policy: the link was quiet
    /// or the frame was cut short. Protocol violations are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModbusError::IncompleteFrame { .. } | ModbusError::CommunicationError(_)
        )
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::SerializationError(format!("TOML error: {}", err))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<serialport::Error> for ModbusError {
    fn from(err: serialport::Error) -> Self {
        ModbusError::CommunicationError(format!("Serial port error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ModbusError::IncompleteFrame { expected: 9, received: 0 }.is_transient());
        assert!(ModbusError::CommunicationError("timeout".into()).is_transient());
        assert!(!ModbusError::CrcMismatch { expected: 1, received: 2 }.is_transient());
        assert!(!ModbusError::FunctionCodeMismatch { expected: 3, received: 4 }.is_transient());
    }

    #[test]
    fn test_exception_message_carries_code() {
        let err = ModbusError::ExceptionResponse(ExceptionCode::IllegalDataAddress);
        assert!(err.to_string().contains("0x02"));
    }
}
