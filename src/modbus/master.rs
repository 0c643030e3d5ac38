use log::{debug, error, info, warn};
use std::thread;
use std::time::Duration;

use super::protocol::{
    self, decode_read_response, decode_write_response, encode_read, encode_write, exception_code,
    read_response_len, verify_crc, FunctionCode, WriteResponse, EXCEPTION_FRAME_LEN,
    FIXED_FRAME_LEN, MAX_READ_COUNT,
};
use super::transport::{SerialTransport, Transport};
use crate::config::settings::DeviceConfig;
use crate::utils::error::ModbusError;

pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterOptions {
    /// Pause between writing a request and reading the reply, covering the
    /// line turnaround of the peer.
    pub settle: Duration,
    /// Extra attempts after a quiet or truncated reply. Zero disables retry.
    pub retries: u8,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            retries: 0,
        }
    }
}

/// The raw frames of the most recent transaction attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// Issues one request/response transaction per call against a single slave.
///
/// The master owns its transport; a transaction is never interleaved with
/// another one because every operation takes `&mut self`.
pub struct ModbusMaster<T: Transport = SerialTransport> {
    transport: T,
    slave_address: u8,
    options: MasterOptions,
    last_exchange: Option<Exchange>,
}

impl ModbusMaster<SerialTransport> {
    pub fn open(config: &DeviceConfig, options: MasterOptions) -> Result<Self, ModbusError> {
        config.validate()?;
        let transport = SerialTransport::open(config)?;
        Ok(Self::new(transport, config.address, options))
    }
}

impl<T: Transport> ModbusMaster<T> {
    pub fn new(transport: T, slave_address: u8, options: MasterOptions) -> Self {
        Self {
            transport,
            slave_address,
            options,
            last_exchange: None,
        }
    }

    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    pub fn options(&self) -> &MasterOptions {
        &self.options
    }

    pub fn last_exchange(&self) -> Option<&Exchange> {
        self.last_exchange.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Reads `count` holding registers starting at `start_register`.
    pub fn read_holding_registers(
        &mut self,
        start_register: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        if count == 0 || count > MAX_READ_COUNT {
            let err = ModbusError::InvalidData(format!(
                "register count must be between 1 and {}, got {}",
                MAX_READ_COUNT, count
            ));
            error!("Failed to read register {}: {}", start_register, err);
            return Err(err);
        }

        debug!(
            "📊 Reading {} registers from device {} starting at address {}",
            count, self.slave_address, start_register
        );

        let request = encode_read(self.slave_address, start_register, count);
        let expected_len = read_response_len(count);
        let slave_address = self.slave_address;

        let result = self.transact(&request, expected_len, |response| {
            check_read_response(response, slave_address, count)
        });

        match &result {
            Ok(values) => info!("Read register {} with value: {:?}", start_register, values),
            Err(e) => error!("Failed to read register {}: {}", start_register, e),
        }
        result
    }

    /// Writes `value` to `register` and verifies the device's echo.
    pub fn write_register(&mut self, register: u16, value: u16) -> Result<(), ModbusError> {
        let request = encode_write(self.slave_address, register, value);
        let slave_address = self.slave_address;

        let result = self.transact(&request, FIXED_FRAME_LEN, |response| {
            check_write_response(response, slave_address, register, value)
        });

        match &result {
            Ok(()) => info!("Wrote value {} to register {}", value, register),
            Err(e) => error!("Failed to write to register {}: {}", register, e),
        }
        result
    }

    /// Runs one transaction, repeating it only for transient failures and
    /// only as many times as the retry policy allows.
    fn transact<R, F>(
        &mut self,
        request: &[u8],
        expected_len: usize,
        check: F,
    ) -> Result<R, ModbusError>
    where
        F: Fn(&[u8]) -> Result<R, ModbusError>,
    {
        let attempts = u32::from(self.options.retries) + 1;
        let mut attempt = 1;

        loop {
            let outcome = self
                .exchange(request, expected_len)
                .and_then(|response| check(&response));

            match outcome {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("🔁 Attempt {}/{} failed: {}", attempt, attempts, e);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn exchange(&mut self, request: &[u8], expected_len: usize) -> Result<Vec<u8>, ModbusError> {
        debug!("📤 Request frame: [{}]", protocol::format_frame(request));
        self.transport.write(request)?;

        thread::sleep(self.options.settle);

        let response = self.transport.read(expected_len)?;
        debug!("📥 Response frame: [{}]", protocol::format_frame(&response));

        self.last_exchange = Some(Exchange {
            request: request.to_vec(),
            response: response.clone(),
        });
        Ok(response)
    }
}

fn check_exception(response: &[u8]) -> Result<(), ModbusError> {
    let Some(code) = exception_code(response) else {
        return Ok(());
    };
    if response.len() >= EXCEPTION_FRAME_LEN {
        verify_crc(&response[..EXCEPTION_FRAME_LEN])?;
    }
    Err(ModbusError::ExceptionResponse(code))
}

fn warn_on_foreign_address(response: &[u8], slave_address: u8) {
    if let Some(&address) = response.first() {
        if address != slave_address {
            warn!(
                "Response carries address {} while device {} was addressed",
                address, slave_address
            );
        }
    }
}

/// Validates a read reply in wire order: exception, length, CRC, then the
/// function code and byte count.
pub fn check_read_response(
    response: &[u8],
    slave_address: u8,
    count: u16,
) -> Result<Vec<u16>, ModbusError> {
    check_exception(response)?;

    let expected_len = read_response_len(count);
    if response.len() < expected_len {
        return Err(ModbusError::IncompleteFrame {
            expected: expected_len,
            received: response.len(),
        });
    }

    let frame = &response[..expected_len];
    verify_crc(frame)?;
    warn_on_foreign_address(frame, slave_address);

    decode_read_response(frame, count, FunctionCode::ReadHoldingRegisters.code())
}

pub fn check_write_response(
    response: &[u8],
    slave_address: u8,
    register: u16,
    value: u16,
) -> Result<(), ModbusError> {
    check_exception(response)?;

    let echo = decode_write_response(response)?;
    verify_crc(&response[..FIXED_FRAME_LEN])?;
    warn_on_foreign_address(response, slave_address);

    verify_write_echo(&echo, register, value)
}

/// A write succeeds only when function code, register and value all match
/// what was sent.
pub fn verify_write_echo(echo: &WriteResponse, register: u16, value: u16) -> Result<(), ModbusError> {
    if echo.function_code != FunctionCode::WriteSingleRegister.code()
        || echo.register != register
        || echo.value != value
    {
        return Err(ModbusError::WriteVerification {
            register,
            value,
            echoed_function: echo.function_code,
            echoed_register: echo.register,
            echoed_value: echo.value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::protocol::{encode_exception, encode_read_response, ExceptionCode};
    use crate::modbus::transport::MemoryTransport;

    fn fast() -> MasterOptions {
        MasterOptions {
            settle: Duration::ZERO,
            retries: 0,
        }
    }

    fn master_with(replies: Vec<Vec<u8>>, address: u8) -> ModbusMaster<MemoryTransport> {
        ModbusMaster::new(MemoryTransport::with_replies(replies), address, fast())
    }

    #[test]
    fn test_read_reference_scenario() {
        let reply = vec![0x01, 0x03, 0x04, 0x45, 0xEA, 0x32, 0x00, 0xDB, 0xAB];
        let mut master = master_with(vec![reply.clone()], 17);

        let values = master.read_holding_registers(0, 2).unwrap();
        assert_eq!(values, vec![0x45EA, 0x3200]);

        let exchange = master.last_exchange().unwrap();
        assert_eq!(exchange.request, encode_read(17, 0, 2));
        assert_eq!(exchange.response, reply);
        assert_eq!(exchange.response[1], 0x03);
        assert_eq!(exchange.response[2] as usize, 2 * values.len());
    }

    #[test]
    fn test_read_writes_exactly_one_frame() {
        let reply = encode_read_response(3, FunctionCode::ReadHoldingRegisters, &[42]).unwrap();
        let mut master = master_with(vec![reply], 3);
        master.read_holding_registers(100, 1).unwrap();

        let link = master.into_transport();
        assert_eq!(link.written(), &[encode_read(3, 100, 1)]);
    }

    #[test]
    fn test_read_rejects_bad_count_without_io() {
        let mut master = master_with(vec![], 1);
        assert!(matches!(
            master.read_holding_registers(0, 0),
            Err(ModbusError::InvalidData(_))
        ));
        assert!(matches!(
            master.read_holding_registers(0, 126),
            Err(ModbusError::InvalidData(_))
        ));
        assert!(master.transport().written().is_empty());
    }

    #[test]
    fn test_read_incomplete_on_silence() {
        let mut master = master_with(vec![], 1);
        assert!(matches!(
            master.read_holding_registers(0, 2),
            Err(ModbusError::IncompleteFrame { expected: 9, received: 0 })
        ));
    }

    #[test]
    fn test_read_exception_reply() {
        let reply = encode_exception(1, 0x03, ExceptionCode::IllegalDataAddress);
        let mut master = master_with(vec![reply], 1);
        assert!(matches!(
            master.read_holding_registers(0x1000, 4),
            Err(ModbusError::ExceptionResponse(ExceptionCode::IllegalDataAddress))
        ));
    }

    #[test]
    fn test_read_crc_corruption_detected() {
        let mut reply = encode_read_response(1, FunctionCode::ReadHoldingRegisters, &[1, 2]).unwrap();
        reply[4] ^= 0xFF;
        let mut master = master_with(vec![reply], 1);
        assert!(matches!(
            master.read_holding_registers(0, 2),
            Err(ModbusError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_read_function_code_mismatch() {
        let reply = encode_read_response(1, FunctionCode::ReadInputRegisters, &[1]).unwrap();
        let mut master = master_with(vec![reply], 1);
        assert!(matches!(
            master.read_holding_registers(0, 1),
            Err(ModbusError::FunctionCodeMismatch { expected: 0x03, received: 0x04 })
        ));
    }

    #[test]
    fn test_write_echo_accepted() {
        let mut master = master_with(vec![encode_write(9, 0x0010, 0x1234)], 9);
        master.write_register(0x0010, 0x1234).unwrap();
        assert_eq!(master.transport().written(), &[encode_write(9, 0x0010, 0x1234)]);
    }

    #[test]
    fn test_write_echo_with_any_field_altered_fails() {
        let echo = WriteResponse { function_code: 0x06, register: 5, value: 77 };
        assert!(verify_write_echo(&echo, 5, 77).is_ok());

        let altered = [
            WriteResponse { function_code: 0x03, ..echo },
            WriteResponse { register: 6, ..echo },
            WriteResponse { value: 78, ..echo },
        ];
        for bad in altered {
            assert!(matches!(
                verify_write_echo(&bad, 5, 77),
                Err(ModbusError::WriteVerification { .. })
            ));
        }
    }

    #[test]
    fn test_write_mismatched_echo_frame_fails() {
        // well-formed frame, but for another register
        let mut master = master_with(vec![encode_write(9, 0x0011, 0x1234)], 9);
        assert!(matches!(
            master.write_register(0x0010, 0x1234),
            Err(ModbusError::WriteVerification { echoed_register: 0x0011, .. })
        ));
    }

    #[test]
    fn test_write_truncated_echo() {
        let mut echo = encode_write(9, 1, 2);
        echo.truncate(6);
        let mut master = master_with(vec![echo], 9);
        assert!(matches!(
            master.write_register(1, 2),
            Err(ModbusError::IncompleteFrame { expected: 8, received: 6 })
        ));
    }

    #[test]
    fn test_no_retry_by_default() {
        let reply = encode_read_response(1, FunctionCode::ReadHoldingRegisters, &[5]).unwrap();
        let mut master = master_with(vec![vec![], reply], 1);
        assert!(master.read_holding_registers(0, 1).is_err());
        assert_eq!(master.transport().written().len(), 1);
        assert_eq!(master.transport().pending_replies(), 1);
    }

    #[test]
    fn test_bounded_retry_on_silence() {
        let reply = encode_read_response(1, FunctionCode::ReadHoldingRegisters, &[5]).unwrap();
        let options = MasterOptions { retries: 2, ..fast() };
        let link = MemoryTransport::with_replies(vec![vec![], vec![0x01, 0x03], reply]);
        let mut master = ModbusMaster::new(link, 1, options);

        assert_eq!(master.read_holding_registers(0, 1).unwrap(), vec![5]);
        assert_eq!(master.transport().written().len(), 3);
    }

    #[test]
    fn test_retry_never_repeats_protocol_errors() {
        let exception = encode_exception(1, 0x03, ExceptionCode::IllegalFunction);
        let options = MasterOptions { retries: 3, ..fast() };
        let mut master = ModbusMaster::new(MemoryTransport::with_replies(vec![exception]), 1, options);

        assert!(master.read_holding_registers(0, 1).is_err());
        assert_eq!(master.transport().written().len(), 1);
    }
}
