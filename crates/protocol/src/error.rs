//! Protocol error types

use thiserror::Error;

/// USB/IP wire codec errors
///
/// All of these are connection-local: the connection server closes the
/// offending connection and keeps serving everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbIpError {
    /// Header carries a protocol version we do not speak
    #[error("Malformed header: unknown version {version:#06x}")]
    MalformedHeader { version: u16 },

    /// Fewer bytes available than the message declares
    #[error("Truncated message: needed {needed} bytes, got {available}")]
    TruncatedMessage { needed: usize, available: usize },

    /// Well-formed header with a command code we do not handle
    #[error("Unsupported command: {0:#06x}")]
    UnsupportedCommand(u32),

    /// Declared payload exceeds what the server is willing to buffer
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A value does not fit its fixed-width wire field
    #[error("Field {field} cannot hold {value}")]
    FieldOverflow { field: &'static str, value: usize },

    /// Buffer holds more bytes than a single message
    #[error("Trailing bytes after message: {extra}")]
    TrailingBytes { extra: usize },
}

impl UsbIpError {
    /// Whether more input could turn this error into a successful decode
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::TruncatedMessage { .. })
    }
}

/// IPC framing errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error from postcard
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for USB/IP codec results
pub type Result<T> = std::result::Result<T, UsbIpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UsbIpError::UnsupportedCommand(0x8009);
        assert_eq!(err.to_string(), "Unsupported command: 0x8009");

        let err = UsbIpError::TruncatedMessage {
            needed: 48,
            available: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("48"));
        assert!(msg.contains("20"));
    }

    #[test]
    fn test_is_truncated() {
        assert!(
            UsbIpError::TruncatedMessage {
                needed: 8,
                available: 0
            }
            .is_truncated()
        );
        assert!(!UsbIpError::MalformedHeader { version: 0x0200 }.is_truncated());
    }

    #[test]
    fn test_frame_too_large_error() {
        let err = ProtocolError::FrameTooLarge {
            size: 10_000_000,
            max: 1_000_000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Frame too large"));
    }
}
