pub mod crc;
pub mod master;
pub mod protocol;
pub mod slave;
pub mod transport;

pub use crc::crc16_modbus;
pub use master::{Exchange, MasterOptions, ModbusMaster};
pub use protocol::{ExceptionCode, FunctionCode, ReadRequest, Request, WriteRequest, WriteResponse};
pub use slave::{FrameAnalysis, ModbusSlave, RegisterBank, ResponseMode, SlaveStats};
pub use transport::{enumerate_ports, MemoryTransport, PortInfo, SerialTransport, Transport};
