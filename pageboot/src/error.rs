//! Error types for pageboot.

use crate::protocol::Command;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for pageboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pageboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No complete response frame arrived before the deadline.
    #[error("Timeout: no response to {command} within {}ms ({received} bytes received)", .waited.as_millis())]
    Timeout {
        /// Command that was sent.
        command: Command,
        /// How long the engine waited.
        waited: Duration,
        /// Bytes accumulated before giving up.
        received: usize,
    },

    /// The device answered with the error code.
    #[error("Device reported an error for {command}")]
    DeviceError {
        /// Command that was refused.
        command: Command,
    },

    /// The response command byte is not the complement of the request.
    #[error("Protocol mismatch: {command} answered with 0x{response:02X}, expected 0x{:02X}", .command.echo())]
    ProtocolMismatch {
        /// Command that was sent.
        command: Command,
        /// Command byte found in the response.
        response: u8,
    },

    /// The activation sequence failed.
    #[error("Could not connect to the bootloader: {0}")]
    ConnectFailed(#[source] Box<Error>),

    /// A hex line could not be decoded into bytes.
    #[error("Malformed record on line {line}: {reason}")]
    MalformedRecord {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The declared byte count disagrees with the record length.
    #[error("Record length on line {line} is {actual} bytes, byte count {declared} requires {}", .declared + 5)]
    RecordLengthMismatch {
        /// 1-based line number.
        line: usize,
        /// Byte count declared in the record.
        declared: usize,
        /// Decoded record length.
        actual: usize,
    },

    /// The 8-bit sum of a record is not zero.
    #[error("Checksum error on line {line}: record sums to 0x{sum:02X}")]
    ChecksumError {
        /// 1-based line number.
        line: usize,
        /// The non-zero 8-bit sum.
        sum: u8,
    },

    /// A data record does not continue where the previous one ended.
    #[error("Address discontinuity on line {line}: expected 0x{expected:04X}, found 0x{found:04X}")]
    AddressDiscontinuity {
        /// 1-based line number.
        line: usize,
        /// Address that would continue the image.
        expected: u32,
        /// Address found in the record.
        found: u32,
    },

    /// The image does not fit the writable part of flash.
    #[error("Image too large: {size} bytes, {available} bytes available in flash")]
    ImageTooLarge {
        /// Image length in bytes.
        size: usize,
        /// Flash size minus the boot section.
        available: usize,
    },

    /// Fewer bytes were read back than were written.
    #[error("Verify failed: read {read} bytes, programmed {written} bytes")]
    VerifyLengthMismatch {
        /// Bytes written.
        written: usize,
        /// Bytes read back.
        read: usize,
    },

    /// Read-back data differs from the written image.
    #[error("Verify failed at 0x{address:04X}: expected 0x{expected:02X}, read 0x{actual:02X}")]
    VerifyMismatch {
        /// Absolute address of the first difference.
        address: u32,
        /// Byte in the image.
        expected: u8,
        /// Byte read from the device.
        actual: u8,
    },

    /// Reading a page failed; the read was aborted.
    #[error("Error reading page {page} of {total}: {source}")]
    ReadFailed {
        /// 1-based page index.
        page: usize,
        /// Pages in the operation.
        total: usize,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// Writing a page failed; the device is partially programmed.
    #[error("Error writing page {page} of {total}: {source}")]
    WriteFailed {
        /// 1-based page index.
        page: usize,
        /// Pages in the operation.
        total: usize,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// A device operation was requested without an active connection.
    #[error("Not connected to a bootloader")]
    NotConnected,

    /// The device reported geometry that cannot be worked with.
    #[error("Invalid flash geometry: {0}")]
    InvalidGeometry(String),

    /// The operation was cancelled between pages.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error (or its wrapped cause) is a response timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ConnectFailed(inner)
            | Self::ReadFailed { source: inner, .. }
            | Self::WriteFailed { source: inner, .. } => inner.is_timeout(),
            _ => false,
        }
    }

    /// Whether the error came from the hex codec.
    pub fn is_hex_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedRecord { .. }
                | Self::RecordLengthMismatch { .. }
                | Self::ChecksumError { .. }
                | Self::AddressDiscontinuity { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_mismatch_message_names_expected_echo() {
        let err = Error::ProtocolMismatch {
            command: Command::WritePage,
            response: 0x12,
        };
        let msg = err.to_string();
        assert!(msg.contains("write page"));
        assert!(msg.contains("0x12"));
        assert!(msg.contains("0xCD"));
    }

    #[test]
    fn test_is_timeout_sees_through_wrappers() {
        let timeout = Error::Timeout {
            command: Command::ReadPage,
            waited: Duration::from_secs(3),
            received: 0,
        };
        let wrapped = Error::ReadFailed {
            page: 2,
            total: 4,
            source: Box::new(timeout),
        };
        assert!(wrapped.is_timeout());
        assert!(Error::ConnectFailed(Box::new(wrapped)).is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }

    #[test]
    fn test_write_failed_message_has_page_context() {
        let err = Error::WriteFailed {
            page: 3,
            total: 7,
            source: Box::new(Error::DeviceError {
                command: Command::WritePage,
            }),
        };
        assert_eq!(
            err.to_string(),
            "Error writing page 3 of 7: Device reported an error for write page (0x32)"
        );
    }

    #[test]
    fn test_record_length_message() {
        let err = Error::RecordLengthMismatch {
            line: 4,
            declared: 16,
            actual: 20,
        };
        assert!(err.to_string().contains("requires 21"));
        assert!(err.is_hex_error());
    }
}
