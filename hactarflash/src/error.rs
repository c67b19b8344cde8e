//! Error types for hactarflash.

use std::io;
use thiserror::Error;

/// Result type for hactarflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The serial link failed or the device stayed silent.
    Transport,
    /// The device answered, but not in the way the protocol requires.
    Protocol,
    /// Read-back memory did not match what was written or erased.
    Verification,
    /// Invalid mode, missing image or unusable sector table.
    Configuration,
    /// The embedding application asked to stop.
    Interrupted,
}

/// Error type for hactarflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No reply arrived within the retry budget.
    #[error("{stage}: no reply from device")]
    NoReply {
        /// Protocol step that was waiting.
        stage: String,
    },

    /// No serial port to use.
    #[error("No serial port found")]
    DeviceNotFound,

    /// The transport was used while closed.
    #[error("Serial link is not open")]
    TransportClosed,

    /// The device answered with NACK.
    #[error("{stage}: device answered NACK")]
    Nack {
        /// Protocol step that was rejected.
        stage: String,
    },

    /// A byte other than ACK or NACK arrived where an acknowledgement was required.
    #[error("{stage}: unexpected reply byte {got:#04x}")]
    UnexpectedReply {
        /// Protocol step that was waiting.
        stage: String,
        /// The byte that arrived.
        got: u8,
    },

    /// The bootloader does not implement a command the flow needs.
    #[error("Bootloader does not support command {command:#04x}")]
    Unsupported {
        /// Command code.
        command: u8,
    },

    /// A framed response carried a different command than requested.
    #[error("Unexpected response: expected command {expected:#04x}, got {got:#04x}")]
    UnexpectedResponse {
        /// Command that was requested.
        expected: u8,
        /// Command that arrived instead.
        got: u8,
    },

    /// The device reported a failure status for a command.
    #[error("{stage}: device reported failure (error code {status:#04x})")]
    DeviceFailure {
        /// Protocol step that failed.
        stage: String,
        /// Error code reported by the device.
        status: u8,
    },

    /// Malformed frame or escape sequence.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Decoded frame was shorter than its fixed header.
    #[error("Short frame: {len} header bytes, expected 8")]
    ShortHeader {
        /// Number of bytes present after unescaping.
        len: usize,
    },

    /// MD5 digest reported by the device differs from the image digest.
    #[error("MD5 mismatch at {address:#010x}: expected {expected}, device reported {actual}")]
    Md5Mismatch {
        /// Flash address of the verified region.
        address: u32,
        /// Digest of the local image.
        expected: String,
        /// Digest reported by the device.
        actual: String,
    },

    /// Memory read back from the device did not match.
    #[error("{stage}: verification failed at address {address:#010x}")]
    Verification {
        /// Verification step (erase or write).
        stage: String,
        /// First mismatching address.
        address: u32,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was interrupted by the user.
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Shorthand for [`Error::NoReply`].
    pub(crate) fn no_reply(stage: impl Into<String>) -> Self {
        Self::NoReply {
            stage: stage.into(),
        }
    }

    /// Shorthand for [`Error::Nack`].
    pub(crate) fn nack(stage: impl Into<String>) -> Self {
        Self::Nack {
            stage: stage.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::NoReply { .. } | Self::DeviceNotFound | Self::TransportClosed => {
                ErrorCategory::Transport
            },
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorCategory::Transport,
            Self::Nack { .. }
            | Self::UnexpectedReply { .. }
            | Self::Unsupported { .. }
            | Self::UnexpectedResponse { .. }
            | Self::DeviceFailure { .. }
            | Self::Framing(_)
            | Self::ShortHeader { .. }
            | Self::Md5Mismatch { .. } => ErrorCategory::Protocol,
            Self::Verification { .. } => ErrorCategory::Verification,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Interrupted => ErrorCategory::Interrupted,
        }
    }
}
