pub mod settings;

pub use settings::{DeviceConfig, ParityConfig, Role, SessionStore, StopBitsConfig};
