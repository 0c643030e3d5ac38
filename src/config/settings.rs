use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::utils::error::ModbusError;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Which side of the link a session describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    fn session_file(self) -> &'static str {
        match self {
            Role::Master => "modbus_session_master.toml",
            Role::Slave => "modbus_session_slave.toml",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

impl FromStr for Role {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            other => Err(ModbusError::ConfigError(format!(
                "Invalid config type '{}'. Use 'master' or 'slave'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParityConfig {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl fmt::Display for ParityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParityConfig::None => write!(f, "N"),
            ParityConfig::Even => write!(f, "E"),
            ParityConfig::Odd => write!(f, "O"),
        }
    }
}

impl FromStr for ParityConfig {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(ParityConfig::None),
            "E" | "EVEN" => Ok(ParityConfig::Even),
            "O" | "ODD" => Ok(ParityConfig::Odd),
            other => Err(ModbusError::ConfigError(format!(
                "Invalid parity '{}'. Use N, E or O",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBitsConfig {
    #[default]
    One,
    Two,
}

impl TryFrom<u8> for StopBitsConfig {
    type Error = ModbusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBitsConfig::One),
            2 => Ok(StopBitsConfig::Two),
            other => Err(ModbusError::ConfigError(format!(
                "Invalid stop bits {}. Use 1 or 2",
                other
            ))),
        }
    }
}

impl From<StopBitsConfig> for u8 {
    fn from(value: StopBitsConfig) -> Self {
        match value {
            StopBitsConfig::One => 1,
            StopBitsConfig::Two => 2,
        }
    }
}

impl fmt::Display for StopBitsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Serial parameters plus the bus address of the peer (master) or of
/// ourselves (slave).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub port: String,
    pub address: u8,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: ParityConfig,
    #[serde(default)]
    pub stop_bits: StopBitsConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl DeviceConfig {
    pub fn new(port: impl Into<String>, address: u8) -> Self {
        Self {
            port: port.into(),
            address,
            baud_rate: DEFAULT_BAUD_RATE,
            parity: ParityConfig::None,
            stop_bits: StopBitsConfig::One,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.port.trim().is_empty() {
            return Err(ModbusError::ConfigError("Serial port must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::ConfigError("Baud rate must be greater than 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ModbusError::ConfigError("Timeout must be greater than 0".into()));
        }
        Ok(())
    }

    /// Key/value view used when rendering the configuration.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("PORT", self.port.clone()),
            ("ADDRESS", self.address.to_string()),
            ("BAUD RATE", self.baud_rate.to_string()),
            ("PARITY", self.parity.to_string()),
            ("STOP BITS", self.stop_bits.to_string()),
            ("TIMEOUT", format!("{} ms", self.timeout_ms)),
        ]
    }
}

/// Persists one `DeviceConfig` per role as a TOML file in a directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(".")
    }
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, role: Role) -> PathBuf {
        self.dir.join(role.session_file())
    }

    /// `Ok(None)` when no session was saved for `role`.
    pub fn load(&self, role: Role) -> Result<Option<DeviceConfig>, ModbusError> {
        let path = self.path(role);
        if !path.exists() {
            debug!("No {} session at {}", role, path.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let config: DeviceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Like [`SessionStore::load`] but a missing session is an error.
    pub fn require(&self, role: Role) -> Result<DeviceConfig, ModbusError> {
        self.load(role)?.ok_or(ModbusError::NoSession(role))
    }

    pub fn save(&self, role: Role, config: &DeviceConfig) -> Result<(), ModbusError> {
        config.validate()?;

        let path = self.path(role);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        std::fs::write(&path, content)?;
        info!("💾 Saved {} session to {}", role, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut config = DeviceConfig::new("/dev/ttyUSB0", 17);
        config.parity = ParityConfig::Even;
        config.stop_bits = StopBitsConfig::Two;
        config.baud_rate = 19200;

        store.save(Role::Master, &config).unwrap();
        assert_eq!(store.load(Role::Master).unwrap(), Some(config));
        assert_eq!(store.load(Role::Slave).unwrap(), None);
    }

    #[test]
    fn test_missing_session_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(matches!(
            store.require(Role::Slave),
            Err(ModbusError::NoSession(Role::Slave))
        ));
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: DeviceConfig = toml::from_str("port = \"COM3\"\naddress = 5\n").unwrap();
        assert_eq!(config, DeviceConfig::new("COM3", 5));
    }

    #[test]
    fn test_invalid_stop_bits_rejected() {
        let parsed: Result<DeviceConfig, _> =
            toml::from_str("port = \"COM3\"\naddress = 5\nstop_bits = 3\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_parity_and_role() {
        assert_eq!("e".parse::<ParityConfig>().unwrap(), ParityConfig::Even);
        assert_eq!("None".parse::<ParityConfig>().unwrap(), ParityConfig::None);
        assert!("X".parse::<ParityConfig>().is_err());
        assert_eq!("Slave".parse::<Role>().unwrap(), Role::Slave);
        assert!("both".parse::<Role>().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_port() {
        assert!(DeviceConfig::new("  ", 1).validate().is_err());
        assert!(DeviceConfig::new("/dev/ttyS0", 1).validate().is_ok());
    }
}
