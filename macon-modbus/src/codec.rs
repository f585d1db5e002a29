//! Modbus RTU frame construction and validation.
//!
//! An RTU application data unit is laid out as:
//!
//! ```text
//! | slave (1) | function (1) | payload (n) | crc (2, little-endian) |
//! ```
//!
//! The CRC is CRC-16/MODBUS (reflected polynomial 0xA001, seed 0xFFFF)
//! computed over slave, function and payload.

use crc::{CRC_16_MODBUS, Crc};
use std::fmt;

use crate::error::DecodeError;

/// Function code: read holding registers.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Function code: write single register.
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

/// High bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Slave + function + CRC.
pub const MIN_FRAME_LEN: usize = 4;

/// Largest RTU frame allowed by the protocol.
pub const MAX_FRAME_LEN: usize = 256;

/// Largest register count a single read request may ask for.
pub const MAX_READ_COUNT: u16 = 125;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC16 over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// A decoded RTU frame with a verified checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub slave: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

/// Build an RTU frame: fields followed by the little-endian CRC.
pub fn encode(slave: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + MIN_FRAME_LEN);
    frame.push(slave);
    frame.push(function);
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Parse and validate an RTU frame.
///
/// The checksum is verified before the function code is looked at, so a
/// corrupted exception response is reported as a checksum failure.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::framing(format!(
            "frame too short: {} byte(s)",
            bytes.len()
        )));
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(DecodeError::framing(format!(
            "frame too long: {} bytes",
            bytes.len()
        )));
    }

    let data_len = bytes.len() - 2;
    let received = u16::from_le_bytes([bytes[data_len], bytes[data_len + 1]]);
    let computed = crc16(&bytes[..data_len]);
    if received != computed {
        return Err(DecodeError::Checksum { computed, received });
    }

    let slave = bytes[0];
    let function = bytes[1];
    let payload = &bytes[2..data_len];

    if function & EXCEPTION_FLAG != 0 {
        let code = payload
            .first()
            .copied()
            .ok_or_else(|| DecodeError::framing("exception response without code"))?;
        return Err(DecodeError::DeviceException {
            function: function & !EXCEPTION_FLAG,
            code: ExceptionCode::from(code),
        });
    }

    Ok(Frame {
        slave,
        function,
        payload: payload.to_vec(),
    })
}

/// Modbus exception codes returned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Other(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
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
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::ServerDeviceFailure => "server device failure",
            ExceptionCode::Acknowledge => "acknowledge",
            ExceptionCode::ServerDeviceBusy => "server device busy",
            ExceptionCode::MemoryParityError => "memory parity error",
            ExceptionCode::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => "gateway target failed to respond",
            ExceptionCode::Other(code) => return write!(f, "exception 0x{:02X}", code),
        };
        f.write_str(text)
    }
}

/// The subset of Modbus requests this driver issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { address: u16, count: u16 },
    WriteSingleRegister { address: u16, value: u16 },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            Request::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
        }
    }

    /// Request payload: address followed by count or value, both big-endian.
    pub fn payload(&self) -> [u8; 4] {
        let (address, second) = match *self {
            Request::ReadHoldingRegisters { address, count } => (address, count),
            Request::WriteSingleRegister { address, value } => (address, value),
        };
        let [a_hi, a_lo] = address.to_be_bytes();
        let [s_hi, s_lo] = second.to_be_bytes();
        [a_hi, a_lo, s_hi, s_lo]
    }

    /// Encode this request as a complete RTU frame for `slave`.
    pub fn to_frame(&self, slave: u8) -> Vec<u8> {
        encode(slave, self.function_code(), &self.payload())
    }

    /// Length in bytes of a successful response frame.
    pub fn expected_response_len(&self) -> usize {
        match self {
            Request::ReadHoldingRegisters { count, .. } => 5 + 2 * *count as usize,
            Request::WriteSingleRegister { .. } => 8,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Request::WriteSingleRegister { .. })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::ReadHoldingRegisters { address, count } => {
                write!(f, "read {} register(s) at {}", count, address)
            }
            Request::WriteSingleRegister { address, value } => {
                write!(f, "write {} to register {}", value, address)
            }
        }
    }
}

/// A validated response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadHoldingRegisters(Vec<u16>),
    WriteSingleRegister { address: u16, value: u16 },
}

impl Response {
    /// Interpret `frame` as the response to `request` from `slave`.
    pub fn parse(request: &Request, slave: u8, frame: &Frame) -> Result<Self, DecodeError> {
        if frame.slave != slave {
            return Err(DecodeError::framing(format!(
                "response from slave {}, expected {}",
                frame.slave, slave
            )));
        }
        if frame.function != request.function_code() {
            return Err(DecodeError::framing(format!(
                "function 0x{:02X} in response, expected 0x{:02X}",
                frame.function,
                request.function_code()
            )));
        }

        match *request {
            Request::ReadHoldingRegisters { count, .. } => {
                let (byte_count, data) = frame
                    .payload
                    .split_first()
                    .ok_or_else(|| DecodeError::framing("read response without byte count"))?;
                let expected = 2 * count as usize;
                if *byte_count as usize != expected || data.len() != expected {
                    return Err(DecodeError::framing(format!(
                        "read response carries {} byte(s) (count byte {}), expected {}",
                        data.len(),
                        byte_count,
                        expected
                    )));
                }
                let words = data
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(Response::ReadHoldingRegisters(words))
            }
            Request::WriteSingleRegister { address, value } => {
                if frame.payload.len() != 4 {
                    return Err(DecodeError::framing(format!(
                        "write response payload is {} byte(s), expected 4",
                        frame.payload.len()
                    )));
                }
                let echoed_address = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                let echoed_value = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
                if echoed_address != address || echoed_value != value {
                    return Err(DecodeError::framing(format!(
                        "write echo {}={} does not match request {}={}",
                        echoed_address, echoed_value, address, value
                    )));
                }
                Ok(Response::WriteSingleRegister { address, value })
            }
        }
    }

    /// Register words of a read response.
    pub fn into_registers(self) -> Option<Vec<u16>> {
        match self {
            Response::ReadHoldingRegisters(words) => Some(words),
            Response::WriteSingleRegister { .. } => None,
        }
    }
}

/// Build the response frame a device would send for `words`.
pub fn encode_read_response(slave: u8, words: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + 2 * words.len());
    payload.push((2 * words.len()) as u8);
    for word in words {
        payload.extend_from_slice(&word.to_be_bytes());
    }
    encode(slave, READ_HOLDING_REGISTERS, &payload)
}

/// Build an exception response frame.
pub fn encode_exception(slave: u8, function: u8, code: ExceptionCode) -> Vec<u8> {
    encode(slave, function | EXCEPTION_FLAG, &[u8::from(code)])
}

/// Format bytes as space-separated hex for frame tracing.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
