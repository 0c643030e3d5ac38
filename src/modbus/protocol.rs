//! Modbus RTU frame layout: `[address][function][payload..][crc lo][crc hi]`.
//!
//! Register numbers, counts and values travel big-endian; the trailing CRC
//! is the only little-endian field.

use std::fmt;

use super::crc::{append_crc, frame_crc};
use crate::utils::error::ModbusError;

/// High bit of the function byte, set by a device reporting an error.
pub const EXCEPTION_BIT: u8 = 0x80;

/// Largest register count a single read may request (250 data bytes).
pub const MAX_READ_COUNT: u16 = 125;

/// Request frames and write echoes are always eight bytes long.
pub const FIXED_FRAME_LEN: usize = 8;

/// Exception replies: address, function | 0x80, code, two CRC bytes.
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Length of a read response carrying `count` registers.
pub fn read_response_len(count: u16) -> usize {
    5 + 2 * count as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleRegister,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleRegister => 0x06,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Other(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            other => ExceptionCode::Other(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        match code {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::ServerDeviceFailure => "server device failure",
            ExceptionCode::Other(_) => "device specific error",
        };
        write!(f, "{} (0x{:02X})", name, u8::from(*self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u8,
    pub function: FunctionCode,
    pub start_register: u16,
    pub count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub address: u8,
    pub register: u16,
    pub value: u16,
}

/// Fields echoed back by a device after a single register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub function_code: u8,
    pub register: u16,
    pub value: u16,
}

/// A request decoded on the slave side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Read(ReadRequest),
    Write(WriteRequest),
}

impl Request {
    pub fn address(&self) -> u8 {
        match self {
            Request::Read(req) => req.address,
            Request::Write(req) => req.address,
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Request::Read(req) => req.function,
            Request::Write(_) => FunctionCode::WriteSingleRegister,
        }
    }
}

fn pack_message(address: u8, function_code: u8, first: u16, second: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FIXED_FRAME_LEN);
    frame.push(address);
    frame.push(function_code);
    frame.extend_from_slice(&first.to_be_bytes());
    frame.extend_from_slice(&second.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Read holding registers (0x03) request frame.
pub fn encode_read(address: u8, register: u16, count: u16) -> Vec<u8> {
    pack_message(address, FunctionCode::ReadHoldingRegisters.code(), register, count)
}

/// Write single register (0x06) request frame.
pub fn encode_write(address: u8, register: u16, value: u16) -> Vec<u8> {
    pack_message(address, FunctionCode::WriteSingleRegister.code(), register, value)
}

/// A successful write reply echoes the request frame.
pub fn encode_write_response(request: &WriteRequest) -> Vec<u8> {
    encode_write(request.address, request.register, request.value)
}

/// Read reply carrying `values`, which must hold 1 to `MAX_READ_COUNT`
/// registers for the byte count to fit in one byte.
pub fn encode_read_response(
    address: u8,
    function: FunctionCode,
    values: &[u16],
) -> Result<Vec<u8>, ModbusError> {
    if values.is_empty() || values.len() > usize::from(MAX_READ_COUNT) {
        return Err(ModbusError::InvalidData(format!(
            "read reply must carry 1 to {} registers, got {}",
            MAX_READ_COUNT,
            values.len()
        )));
    }

    let mut frame = Vec::with_capacity(5 + values.len() * 2);
    frame.push(address);
    frame.push(function.code());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    append_crc(&mut frame);
    Ok(frame)
}

pub fn encode_exception(address: u8, function_code: u8, code: ExceptionCode) -> Vec<u8> {
    let mut frame = vec![address, function_code | EXCEPTION_BIT, code.into()];
    append_crc(&mut frame);
    frame
}

/// Returns the exception code if the frame carries the exception bit.
pub fn exception_code(bytes: &[u8]) -> Option<ExceptionCode> {
    match bytes {
        [_, function, code, ..] if function & EXCEPTION_BIT != 0 => Some(ExceptionCode::from(*code)),
        _ => None,
    }
}

/// Decodes the register values of a read response.
///
/// Checks run in wire order: exception bit, length, echoed function code,
/// then the byte count. CRC is checked separately via [`verify_crc`].
pub fn decode_read_response(
    bytes: &[u8],
    expected_count: u16,
    expected_function_code: u8,
) -> Result<Vec<u16>, ModbusError> {
    if let Some(code) = exception_code(bytes) {
        return Err(ModbusError::ExceptionResponse(code));
    }

    let expected_len = read_response_len(expected_count);
    if bytes.len() < expected_len {
        return Err(ModbusError::IncompleteFrame {
            expected: expected_len,
            received: bytes.len(),
        });
    }

    if bytes[1] != expected_function_code {
        return Err(ModbusError::FunctionCodeMismatch {
            expected: expected_function_code,
            received: bytes[1],
        });
    }

    let byte_count = bytes[2] as usize;
    let data_len = expected_count as usize * 2;
    if byte_count != data_len {
        return Err(ModbusError::ByteCountMismatch {
            expected: data_len,
            received: byte_count,
        });
    }

    Ok(bytes[3..3 + data_len]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Extracts function code, register and value from a write echo.
pub fn decode_write_response(bytes: &[u8]) -> Result<WriteResponse, ModbusError> {
    if bytes.len() < FIXED_FRAME_LEN {
        return Err(ModbusError::IncompleteFrame {
            expected: FIXED_FRAME_LEN,
            received: bytes.len(),
        });
    }

    Ok(WriteResponse {
        function_code: bytes[1],
        register: u16::from_be_bytes([bytes[2], bytes[3]]),
        value: u16::from_be_bytes([bytes[4], bytes[5]]),
    })
}

pub fn verify_crc(frame: &[u8]) -> Result<(), ModbusError> {
    match frame_crc(frame) {
        Some((calculated, received)) if calculated == received => Ok(()),
        Some((calculated, received)) => Err(ModbusError::CrcMismatch {
            expected: calculated,
            received,
        }),
        None => Err(ModbusError::IncompleteFrame {
            expected: 3,
            received: frame.len(),
        }),
    }
}

/// Decodes a fixed-size request frame received by a slave. The CRC is not
/// checked here.
pub fn decode_request(frame: &[u8]) -> Result<Request, ModbusError> {
    if frame.len() < FIXED_FRAME_LEN {
        return Err(ModbusError::IncompleteFrame {
            expected: FIXED_FRAME_LEN,
            received: frame.len(),
        });
    }

    let address = frame[0];
    let first = u16::from_be_bytes([frame[2], frame[3]]);
    let second = u16::from_be_bytes([frame[4], frame[5]]);

    match FunctionCode::from_code(frame[1]) {
        Some(function @ (FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters)) => {
            Ok(Request::Read(ReadRequest {
                address,
                function,
                start_register: first,
                count: second,
            }))
        }
        Some(FunctionCode::WriteSingleRegister) => Ok(Request::Write(WriteRequest {
            address,
            register: first,
            value: second,
        })),
        None => Err(ModbusError::InvalidData(format!(
            "unsupported function code 0x{:02X}",
            frame[1]
        ))),
    }
}

/// Renders a frame as spaced upper-case hex, e.g. `01 03 00 00`.
pub fn format_frame(bytes: &[u8]) -> String {
    let encoded = hex::encode_upper(bytes);
    encoded
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
