//! Core error types and result handling
//!
//! Two distinct vocabularies live here. [`ExceptionCode`] is protocol data:
//! the one-byte reason transmitted back to the client inside an exception
//! PDU. [`ModbusError`] is for faults on the server side itself; the
//! dispatcher converts any processor fault into a `ServerDeviceFailure`
//! exception response, so a `ModbusError` only ever reaches the transport
//! when the handler genuinely cannot continue.

use std::fmt;

use thiserror::Error;

/// Result type for server-side Modbus operations
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Modbus exception codes per the application protocol specification
///
/// The numeric value is the byte that follows `function | 0x80` in an
/// exception response. A request validator may return any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Function code not supported by the server
    IllegalFunction = 0x01,
    /// Requested window falls outside the addressable table
    IllegalDataAddress = 0x02,
    /// Quantity or value field is out of its allowed envelope
    IllegalDataValue = 0x03,
    /// Unrecoverable fault while servicing the request
    ServerDeviceFailure = 0x04,
    /// Long-running operation accepted
    Acknowledge = 0x05,
    /// Server busy with a long-running operation
    ServerDeviceBusy = 0x06,
    /// Extended file area parity check failed
    MemoryParityError = 0x08,
    /// Gateway misconfigured or overloaded
    GatewayPathUnavailable = 0x0A,
    /// Target device behind the gateway did not respond
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Wire value of the exception code
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire value back into an exception code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Human-readable name used in logs
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::ServerDeviceFailure => "Server Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server Device Busy",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailed => "Gateway Target Device Failed To Respond",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.code())
    }
}

/// Server-side Modbus errors
#[derive(Debug, Error, Clone)]
pub enum ModbusError {
    /// Frame buffer fault: cursor ran past the request or the capacity
    #[error("Frame error: {0}")]
    Frame(String),

    /// Dispatch entered without a pending request in the buffer
    #[error("Handler not ready: no request pending")]
    NotReady,

    /// No register bank exists for the addressed unit
    #[error("Unknown unit id: {0}")]
    UnknownUnit(u8),

    /// Register access outside the table bounds
    #[error("Address out of range: {0}")]
    OutOfRange(String),

    /// Transport-level fault (framing adapter, connection teardown)
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Receive loop cancelled via the handler's cancellation signal
    #[error("Cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not valid in the server's current mode or state
    #[error("Invalid state: {0}")]
    State(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::Config(format!("JSON error: {}", err))
    }
}

// Helper methods for creating errors
impl ModbusError {
    pub fn frame(msg: impl Into<String>) -> Self {
        ModbusError::Frame(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        ModbusError::OutOfRange(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ModbusError::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        ModbusError::State(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ModbusError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_wire_values() {
        assert_eq!(ExceptionCode::IllegalFunction.code(), 0x01);
        assert_eq!(ExceptionCode::IllegalDataAddress.code(), 0x02);
        assert_eq!(ExceptionCode::IllegalDataValue.code(), 0x03);
        assert_eq!(ExceptionCode::ServerDeviceFailure.code(), 0x04);
        assert_eq!(ExceptionCode::GatewayTargetFailed.code(), 0x0B);
    }

    #[test]
    fn test_exception_code_roundtrip() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B] {
            let parsed = ExceptionCode::from_code(code).unwrap();
            assert_eq!(parsed.code(), code);
        }

        // Reserved values don't parse
        assert!(ExceptionCode::from_code(0x00).is_none());
        assert!(ExceptionCode::from_code(0x07).is_none());
        assert!(ExceptionCode::from_code(0xFF).is_none());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::frame("read past end of request");
        assert!(err.to_string().contains("read past end"));

        let err = ModbusError::UnknownUnit(17);
        assert!(err.to_string().contains("17"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ModbusError = io_err.into();
        assert!(matches!(err, ModbusError::Io(_)));
    }
}
