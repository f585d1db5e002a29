//! Error taxonomy for the Modbus RTU driver.
//!
//! Errors are layered the same way the components are: frame decoding,
//! bus transactions, register semantics, and the single-attempt write and
//! poll operations built on top of them.

use std::time::Duration;
use thiserror::Error;

use crate::codec::ExceptionCode;

/// Failure to turn received bytes into a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Short, truncated or otherwise malformed frame.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The trailing CRC does not match the frame content.
    #[error("Checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Checksum { computed: u16, received: u16 },

    /// The device answered with a Modbus exception response.
    #[error("Device exception for function 0x{function:02X}: {code}")]
    DeviceException { function: u8, code: ExceptionCode },
}

impl DecodeError {
    /// Create a framing error.
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }
}

/// Failure of a single request/response exchange on the bus.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No complete response arrived within the response timeout.
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Checksum { computed: u16, received: u16 },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Device exception for function 0x{function:02X}: {code}")]
    DeviceException { function: u8, code: ExceptionCode },

    /// The serial link has been closed.
    #[error("Transport closed")]
    Closed,

    /// Serial I/O failed.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure reflects bus noise and may be retried.
    ///
    /// Device exceptions and link failures are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Checksum { .. }
                | TransportError::Framing(_)
        )
    }
}

impl From<DecodeError> for TransportError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Framing(msg) => TransportError::Framing(msg),
            DecodeError::Checksum { computed, received } => {
                TransportError::Checksum { computed, received }
            }
            DecodeError::DeviceException { function, code } => {
                TransportError::DeviceException { function, code }
            }
        }
    }
}

/// Failure to interpret or produce a register value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegisterError {
    #[error("Unknown register '{0}'")]
    UnknownRegister(String),

    /// The value cannot be represented in the register's encoding or domain.
    #[error("Value {value} out of range for register '{register}' ({detail})")]
    OutOfRange {
        register: &'static str,
        value: f64,
        detail: String,
    },

    #[error("Register '{0}' is read-only")]
    Unwritable(&'static str),

    /// Fewer raw words were supplied than the register spans.
    #[error("Register '{register}' needs {expected} word(s), got {actual}")]
    ShortRead {
        register: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Failure of a single-attempt setpoint write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Rejected before any bus access.
    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The read-back value differs from the requested one.
    #[error("Verification of '{register}' failed: wrote {expected}, read back {actual}")]
    VerificationMismatch {
        register: &'static str,
        expected: f64,
        actual: f64,
    },

    /// The device reports an active fault; writes are refused.
    #[error("Active fault on device: {0}")]
    ActiveFault(String),

    /// Host control can only be asserted while the brine pump runs.
    #[error("Brine pump is not running; host control not asserted")]
    PumpNotRunning,
}

/// Failure of one poll cycle. The whole cycle's snapshot is discarded.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Reading registers {start}..{end} failed: {source}")]
    Group {
        start: u16,
        end: u16,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Decode(#[from] RegisterError),

    #[error("Unexpected response to read of {start}: {detail}")]
    UnexpectedResponse { start: u16, detail: String },
}
