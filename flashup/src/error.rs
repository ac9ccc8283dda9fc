//! Error types for flashup.

use std::io;
use thiserror::Error;

/// Result type for flashup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for flashup operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware container is not in the FLASHUP format.
    #[error("Invalid firmware format: {0}")]
    InvalidFormat(String),

    /// Container metadata is not a JSON object with string values.
    #[error("Invalid firmware metadata: {0}")]
    InvalidMetadata(String),

    /// A required metadata field is absent or empty.
    #[error("Missing required metadata field: {0}")]
    MissingField(String),

    /// Payload digest does not match the `sha256` metadata value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Digest recorded in the metadata.
        expected: String,
        /// Digest computed over the payload.
        actual: String,
    },

    /// Container has a valid header but no payload bytes.
    #[error("Firmware container has an empty payload")]
    EmptyPayload,

    /// Connection to the device could not be established.
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    /// A request or connection attempt timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device reported a failure.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// The peer violated the wire protocol.
    #[error("Protocol error: {0}")]
    ProtocolError(String),
}
