//! Protocol errors

use thiserror::Error;

use super::MessageId;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Session closed")]
    SessionClosed,

    #[error("Request for {0:?} timed out")]
    Timeout(MessageId),

    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown message id {0}")]
    UnknownMessage(u16),

    #[error("Buffer overflow: payload of {0} bytes is too large")]
    BufferOverflow(usize),

    #[error("Value {value} out of range for {name}")]
    OutOfRange { name: &'static str, value: i64 },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
