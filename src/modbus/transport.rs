use log::{debug, error, info};
use serialport::{SerialPort, SerialPortType};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crate::config::settings::{DeviceConfig, ParityConfig, StopBitsConfig};
use crate::utils::error::ModbusError;

/// Blocking byte channel the master and slave talk through.
///
/// `read` returns at most `max_bytes`; it returns fewer (possibly none)
/// when the link stays quiet past the configured timeout.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError>;
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, ModbusError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        (**self).write(bytes)
    }

    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, ModbusError> {
        (**self).read(max_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub device: String,
    pub description: String,
}

/// Lists the serial ports known to the operating system.
pub fn enumerate_ports() -> Result<Vec<PortInfo>, ModbusError> {
    let ports = serialport::available_ports()?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let description = match &port.port_type {
                SerialPortType::UsbPort(usb_info) => usb_info
                    .product
                    .clone()
                    .or_else(|| usb_info.manufacturer.clone())
                    .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb_info.vid, usb_info.pid)),
                SerialPortType::PciPort => "PCI serial port".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
                _ => "n/a".to_string(),
            };
            PortInfo {
                device: port.port_name,
                description,
            }
        })
        .collect())
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    port_name: String,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(config: &DeviceConfig) -> Result<Self, ModbusError> {
        info!("🔌 Connecting to Modbus RTU port: {}", config.port);
        info!(
            "⚙️  Configuration: {} baud, 8 data bits, parity {}, {} stop bit(s), timeout {} ms",
            config.baud_rate, config.parity, config.stop_bits, config.timeout_ms
        );

        let serial_parity = match config.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };
        let stop_bits = match config.stop_bits {
            StopBitsConfig::One => serialport::StopBits::One,
            StopBitsConfig::Two => serialport::StopBits::Two,
        };
        let timeout = Duration::from_millis(config.timeout_ms);

        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(stop_bits)
            .parity(serial_parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", config.port, e);
                ModbusError::LinkOpenError(format!("{}: {}", config.port, e))
            })?;

        info!("✅ Initialized device on port {}", config.port);
        Ok(Self {
            port,
            port_name: config.port.clone(),
            timeout,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        self.port
            .write_all(bytes)
            .map_err(|e| ModbusError::CommunicationError(format!("Write failed: {}", e)))?;
        self.port
            .flush()
            .map_err(|e| ModbusError::CommunicationError(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, ModbusError> {
        let mut response = vec![0u8; max_bytes];
        let mut filled = 0;
        let deadline = Instant::now() + self.timeout;

        // The port timeout bounds each call; the deadline bounds the whole read.
        while filled < max_bytes && Instant::now() < deadline {
            match Read::read(&mut *self.port, &mut response[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    debug!("📥 {} byte(s) received on {}", n, self.port_name);
                    filled += n;
                }
                Err(ref e) if e.kind() == ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ModbusError::CommunicationError(format!("Read failed: {}", e)));
                }
            }
        }

        response.truncate(filled);
        Ok(response)
    }
}

/// In-memory transport: replies are queued up front, writes are recorded.
///
/// Each `read` pops one queued chunk (cut to `max_bytes`); an empty queue
/// behaves like a link that timed out.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    replies: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            replies: replies.into_iter().collect(),
            written: Vec::new(),
        }
    }

    pub fn push_reply(&mut self, reply: Vec<u8>) {
        self.replies.push_back(reply);
    }

    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, ModbusError> {
        let mut chunk = self.replies.pop_front().unwrap_or_default();
        chunk.truncate(max_bytes);
        Ok(chunk)
    }
}
