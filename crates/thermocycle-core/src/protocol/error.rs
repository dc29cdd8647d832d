//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the rig controller
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Read timed out")]
    Timeout,

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("Session is closed")]
    Closed,

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Errors the session recovers from on its own (within bounds)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout | ProtocolError::Checksum { .. } | ProtocolError::InvalidFrame(_)
        )
    }
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::Connection(e.to_string()),
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => ProtocolError::Timeout,
            _ => ProtocolError::Serial(e.to_string()),
        }
    }
}
