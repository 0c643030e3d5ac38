//! Slave side of the link: listen, filter by address, answer requests.
//!
//! The loop alternates between two states. While *listening* it blocks in
//! the transport for at most the configured timeout; once a chunk of at
//! least [`MIN_FRAME_LEN`] bytes arrived it *processes* that chunk and goes
//! back to listening. Everything analysed is already in memory, so stopping
//! between iterations never leaves a frame half handled.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::protocol::{
    decode_request, encode_exception, encode_read_response, encode_write_response, format_frame,
    verify_crc, ExceptionCode, FunctionCode, ReadRequest, Request, WriteRequest, FIXED_FRAME_LEN,
    MAX_READ_COUNT,
};
use super::transport::{SerialTransport, Transport};
use crate::config::settings::DeviceConfig;
use crate::utils::error::ModbusError;

/// Upper bound of a single read from the bus.
pub const RX_CHUNK: usize = 100;

/// Anything shorter cannot hold the fields of a read request.
pub const MIN_FRAME_LEN: usize = 6;

/// Fixed reply served in fixture mode: two registers, 0x45EA and 0x3200.
pub const FIXTURE_REPLY: [u8; 9] = [0x01, 0x03, 0x04, 0x45, 0xEA, 0x32, 0x00, 0xDB, 0xAB];

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Answer from the register bank.
    #[default]
    Registers,
    /// Answer every read with [`FIXTURE_REPLY`]; useful to exercise a master.
    Fixture,
}

/// Holding and input registers exposed by the simulated device.
#[derive(Debug, Clone)]
pub struct RegisterBank {
    holding: Vec<u16>,
    input: Vec<u16>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new(usize::from(u16::MAX) + 1)
    }
}

impl RegisterBank {
    /// A bank of `size` zeroed registers of each kind.
    pub fn new(size: usize) -> Self {
        let size = size.min(usize::from(u16::MAX) + 1);
        Self {
            holding: vec![0; size],
            input: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.holding.len()
    }

    pub fn holding(&self, register: u16) -> Option<u16> {
        self.holding.get(usize::from(register)).copied()
    }

    pub fn set_input(&mut self, register: u16, value: u16) -> Result<(), ExceptionCode> {
        let slot = self
            .input
            .get_mut(usize::from(register))
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        *slot = value;
        Ok(())
    }

    pub fn read(
        &self,
        function: FunctionCode,
        start_register: u16,
        count: u16,
    ) -> Result<Vec<u16>, ExceptionCode> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let table = match function {
            FunctionCode::ReadHoldingRegisters => &self.holding,
            FunctionCode::ReadInputRegisters => &self.input,
            FunctionCode::WriteSingleRegister => return Err(ExceptionCode::IllegalFunction),
        };

        let start = usize::from(start_register);
        let end = start + usize::from(count);
        table
            .get(start..end)
            .map(<[u16]>::to_vec)
            .ok_or(ExceptionCode::IllegalDataAddress)
    }

    pub fn write(&mut self, register: u16, value: u16) -> Result<(), ExceptionCode> {
        let slot = self
            .holding
            .get_mut(usize::from(register))
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        *slot = value;
        Ok(())
    }
}

/// Outcome of classifying a received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAnalysis {
    /// Too short to carry a request.
    Incomplete,
    /// Addressed to another device on the bus.
    Foreign(u8),
    /// Addressed to us, but with a function code we do not serve.
    Unrecognized(u8),
    Request(Request),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaveStats {
    pub received: u64,
    pub replied: u64,
    pub crc_errors: u64,
    pub ignored: u64,
}

pub struct ModbusSlave<T: Transport = SerialTransport> {
    transport: T,
    address: u8,
    bank: RegisterBank,
    mode: ResponseMode,
    stats: SlaveStats,
}

impl ModbusSlave<SerialTransport> {
    pub fn open(config: &DeviceConfig, mode: ResponseMode) -> Result<Self, ModbusError> {
        config.validate()?;
        let transport = SerialTransport::open(config)?;
        Ok(Self::new(transport, config.address, mode))
    }
}

impl<T: Transport> ModbusSlave<T> {
    pub fn new(transport: T, address: u8, mode: ResponseMode) -> Self {
        Self {
            transport,
            address,
            bank: RegisterBank::default(),
            mode,
            stats: SlaveStats::default(),
        }
    }

    pub fn with_bank(mut self, bank: RegisterBank) -> Self {
        self.bank = bank;
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut RegisterBank {
        &mut self.bank
    }

    pub fn stats(&self) -> SlaveStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Classifies a frame by address and function code without touching
    /// the CRC.
    pub fn analyze_incoming_data(&self, frame: &[u8]) -> FrameAnalysis {
        let Some(&address) = frame.first() else {
            return FrameAnalysis::Incomplete;
        };
        if address != self.address {
            return FrameAnalysis::Foreign(address);
        }

        match decode_request(frame) {
            Ok(request) => FrameAnalysis::Request(request),
            Err(ModbusError::IncompleteFrame { .. }) => match frame.get(1) {
                Some(&function) if FunctionCode::from_code(function).is_none() => {
                    FrameAnalysis::Unrecognized(function)
                }
                _ => FrameAnalysis::Incomplete,
            },
            Err(_) => FrameAnalysis::Unrecognized(frame[1]),
        }
    }

    /// Handles one received chunk. Returns the reply that was written, or
    /// `None` when the chunk was dropped by policy.
    pub fn process_frame(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, ModbusError> {
        self.stats.received += 1;

        if frame.len() < MIN_FRAME_LEN {
            debug!("Dropping {} byte chunk, too short for a request", frame.len());
            self.stats.ignored += 1;
            return Ok(None);
        }

        let request = match self.analyze_incoming_data(frame) {
            FrameAnalysis::Request(request) => request,
            FrameAnalysis::Foreign(address) => {
                debug!("Slave address does not match ({} != {})", address, self.address);
                self.stats.ignored += 1;
                return Ok(None);
            }
            FrameAnalysis::Unrecognized(function) => {
                warn!("Function code 0x{:02X} not supported", function);
                self.stats.ignored += 1;
                return Ok(None);
            }
            FrameAnalysis::Incomplete => {
                // a truncated request still carries its CRC in the last two bytes
                if let Err(e) = verify_crc(frame) {
                    self.stats.crc_errors += 1;
                    return Err(e);
                }
                debug!("Incomplete request: [{}]", format_frame(frame));
                self.stats.ignored += 1;
                return Ok(None);
            }
        };

        if frame.len() > FIXED_FRAME_LEN {
            debug!(
                "Ignoring {} trailing byte(s) after request",
                frame.len() - FIXED_FRAME_LEN
            );
        }
        if let Err(e) = verify_crc(&frame[..FIXED_FRAME_LEN]) {
            self.stats.crc_errors += 1;
            return Err(e);
        }

        let reply = self.respond(&request);
        self.transport.write(&reply)?;
        self.stats.replied += 1;
        debug!("📤 Reply frame: [{}]", format_frame(&reply));
        Ok(Some(reply))
    }

    fn respond(&mut self, request: &Request) -> Vec<u8> {
        match request {
            Request::Read(read) => self.respond_read(read),
            Request::Write(write) => self.respond_write(write),
        }
    }

    fn respond_read(&self, request: &ReadRequest) -> Vec<u8> {
        info!(
            "We have a request for reading {} registers starting from register {}",
            request.count, request.start_register
        );

        if self.mode == ResponseMode::Fixture {
            return FIXTURE_REPLY.to_vec();
        }

        match self
            .bank
            .read(request.function, request.start_register, request.count)
        {
            Ok(values) => encode_read_response(self.address, request.function, &values)
                .unwrap_or_else(|e| {
                    error!("Cannot encode reply for register {}: {}", request.start_register, e);
                    encode_exception(
                        self.address,
                        request.function.code(),
                        ExceptionCode::ServerDeviceFailure,
                    )
                }),
            Err(code) => {
                warn!("Rejecting read of register {}: {}", request.start_register, code);
                encode_exception(self.address, request.function.code(), code)
            }
        }
    }

    fn respond_write(&mut self, request: &WriteRequest) -> Vec<u8> {
        info!(
            "We have a request for writing {} to register {}",
            request.value, request.register
        );

        match self.bank.write(request.register, request.value) {
            Ok(()) => encode_write_response(request),
            Err(code) => {
                warn!("Rejecting write of register {}: {}", request.register, code);
                encode_exception(
                    self.address,
                    FunctionCode::WriteSingleRegister.code(),
                    code,
                )
            }
        }
    }

    /// One listening step: read a chunk and process it if anything arrived.
    pub fn poll_once(&mut self) -> Result<Option<Vec<u8>>, ModbusError> {
        let data = self.transport.read(RX_CHUNK)?;
        if data.is_empty() {
            return Ok(None);
        }
        debug!("📥 Received: [{}]", format_frame(&data));
        self.process_frame(&data)
    }

    /// Serves requests until `stop` is raised. Failures are confined to the
    /// chunk that caused them.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<SlaveStats, ModbusError> {
        info!("👂 Listening for incoming data as slave {}", self.address);

        while !stop.load(Ordering::Relaxed) {
            match self.poll_once() {
                Ok(_) => {}
                Err(e @ ModbusError::CrcMismatch { .. }) => warn!("CRC Error: {}", e),
                Err(e) => {
                    error!("Slave loop error: {}", e);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }

        info!(
            "🛑 Stopped listening: {} chunk(s), {} repl(ies), {} CRC error(s), {} ignored",
            self.stats.received, self.stats.replied, self.stats.crc_errors, self.stats.ignored
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::crc::append_crc;
    use crate::modbus::protocol::{encode_read, encode_write};
    use crate::modbus::transport::MemoryTransport;

    fn slave(address: u8) -> ModbusSlave<MemoryTransport> {
        ModbusSlave::new(MemoryTransport::new(), address, ResponseMode::Registers)
    }

    #[test]
    fn test_foreign_address_gets_no_reply() {
        let mut slave = slave(17);
        let reply = slave.process_frame(&encode_read(18, 0, 1)).unwrap();
        assert!(reply.is_none());
        assert!(slave.transport().written().is_empty());
        assert_eq!(slave.stats().ignored, 1);
    }

    #[test]
    fn test_short_chunk_dropped() {
        let mut slave = slave(1);
        assert!(slave.process_frame(&[0x01, 0x03, 0x00, 0x00, 0x00]).unwrap().is_none());
        assert!(slave.transport().written().is_empty());
    }

    #[test]
    fn test_truncated_request_reported_as_crc_error() {
        let mut slave = slave(1);
        let request = encode_read(1, 0, 1);

        for len in [6, 7] {
            assert!(matches!(
                slave.process_frame(&request[..len]),
                Err(ModbusError::CrcMismatch { .. })
            ));
        }
        assert_eq!(slave.stats().crc_errors, 2);
        assert!(slave.transport().written().is_empty());
    }

    #[test]
    fn test_read_served_from_bank() {
        let mut slave = slave(1);
        slave.bank_mut().write(10, 0xCAFE).unwrap();
        slave.bank_mut().write(11, 0x0042).unwrap();

        let reply = slave.process_frame(&encode_read(1, 10, 2)).unwrap().unwrap();
        assert_eq!(
            reply,
            encode_read_response(1, FunctionCode::ReadHoldingRegisters, &[0xCAFE, 0x0042]).unwrap()
        );
        assert_eq!(slave.transport().written(), &[reply]);
    }

    #[test]
    fn test_crc_mismatch_dropped_without_reply() {
        let mut slave = slave(1);
        let mut frame = encode_read(1, 0, 1);
        frame[7] ^= 0x55;

        assert!(matches!(
            slave.process_frame(&frame),
            Err(ModbusError::CrcMismatch { .. })
        ));
        assert!(slave.transport().written().is_empty());
        assert_eq!(slave.stats().crc_errors, 1);
    }

    #[test]
    fn test_unsupported_function_dropped() {
        let mut slave = slave(1);
        let mut frame = encode_read(1, 0, 1);
        frame[1] = 0x10;
        assert!(slave.process_frame(&frame).unwrap().is_none());
        assert!(slave.transport().written().is_empty());
    }

    #[test]
    fn test_fixture_mode_replies_with_fixed_frame() {
        let mut slave = ModbusSlave::new(MemoryTransport::new(), 1, ResponseMode::Fixture);
        let reply = slave.process_frame(&encode_read(1, 300, 7)).unwrap().unwrap();
        assert_eq!(reply, FIXTURE_REPLY.to_vec());
    }

    #[test]
    fn test_write_updates_bank_and_echoes() {
        let mut slave = slave(4);
        let request = encode_write(4, 0x0020, 0x1234);
        let reply = slave.process_frame(&request).unwrap().unwrap();
        assert_eq!(reply, request);
        assert_eq!(slave.bank().holding(0x0020), Some(0x1234));
    }

    #[test]
    fn test_read_out_of_bank_returns_exception() {
        let mut slave = ModbusSlave::new(MemoryTransport::new(), 1, ResponseMode::Registers)
            .with_bank(RegisterBank::new(16));
        let reply = slave.process_frame(&encode_read(1, 15, 2)).unwrap().unwrap();
        assert_eq!(reply, encode_exception(1, 0x03, ExceptionCode::IllegalDataAddress));

        let reply = slave.process_frame(&encode_write(1, 16, 1)).unwrap().unwrap();
        assert_eq!(reply, encode_exception(1, 0x06, ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_input_registers_served_separately() {
        let mut slave = slave(2);
        slave.bank_mut().set_input(0, 0x0BAD).unwrap();
        let mut request = vec![0x02, 0x04, 0x00, 0x00, 0x00, 0x01];
        append_crc(&mut request);

        let reply = slave.process_frame(&request).unwrap().unwrap();
        assert_eq!(
            reply,
            encode_read_response(2, FunctionCode::ReadInputRegisters, &[0x0BAD]).unwrap()
        );
    }

    #[test]
    fn test_analyze_incoming_data() {
        let slave = slave(3);
        assert_eq!(slave.analyze_incoming_data(&[]), FrameAnalysis::Incomplete);
        assert_eq!(
            slave.analyze_incoming_data(&encode_read(9, 0, 1)),
            FrameAnalysis::Foreign(9)
        );
        assert_eq!(
            slave.analyze_incoming_data(&[3, 0x2B, 0, 0, 0, 0]),
            FrameAnalysis::Unrecognized(0x2B)
        );
        assert!(matches!(
            slave.analyze_incoming_data(&encode_write(3, 1, 2)),
            FrameAnalysis::Request(Request::Write(_))
        ));
        assert_eq!(
            slave.analyze_incoming_data(&[3, 0x03, 0, 0, 0, 1]),
            FrameAnalysis::Incomplete
        );
    }

    struct StopWhenDrained<'a> {
        inner: MemoryTransport,
        stop: &'a AtomicBool,
    }

    impl Transport for StopWhenDrained<'_> {
        fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
            self.inner.write(bytes)
        }

        fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, ModbusError> {
            if self.inner.pending_replies() <= 1 {
                self.stop.store(true, Ordering::Relaxed);
            }
            self.inner.read(max_bytes)
        }
    }

    #[test]
    fn test_run_until_stopped() {
        let stop = AtomicBool::new(false);
        let mut corrupted = encode_read(5, 0, 1);
        corrupted[6] ^= 0xFF;
        let link = StopWhenDrained {
            inner: MemoryTransport::with_replies(vec![
                encode_read(5, 0, 1),
                encode_read(6, 0, 1),
                corrupted,
                vec![],
                encode_write(5, 1, 9),
            ]),
            stop: &stop,
        };

        let mut slave = ModbusSlave::new(link, 5, ResponseMode::Registers);
        let stats = slave.run(&stop).unwrap();

        assert_eq!(stats.replied, 2);
        assert_eq!(stats.crc_errors, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(slave.transport().inner.written().len(), 2);
        assert_eq!(slave.bank().holding(1), Some(9));
    }
}
