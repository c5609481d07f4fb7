//! Error types for the WebSocket engine

use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
///
/// The engine distinguishes four classes: peer protocol violations, stream
/// I/O failures, invalid API usage, and client handshake failures. Only the
/// last two ever reach user code; the first two are converted to an abort
/// internally.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Peer violated the protocol
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// A frame opcode that does not fit the current message sequence
    #[error("unexpected frame opcode in message sequence")]
    UnexpectedFrame,
    /// Invalid UTF-8 in a text message
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
    /// Assembled message exceeded the configured maximum
    #[error("message too large")]
    MessageTooLarge,
    /// Compression or decompression failed
    #[error("compression error: {0}")]
    Compression(String),
    /// A receive was started while another is outstanding
    #[error("a receive operation is already in progress")]
    ReceiveInProgress,
    /// Handshake failed before the connection was established
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    /// The server refused the upgrade with an HTTP status
    #[error("handshake refused with status {status}")]
    HandshakeRefused {
        /// HTTP status code from the refusal response
        status: u16,
    },
    /// No resolved address accepted a connection
    #[error("no usable address for host")]
    NoUsableAddress {
        /// Error from the last attempted address, if any
        #[source]
        last: Option<io::Error>,
    },
}

impl Error {
    /// Whether this error is I/O-class
    ///
    /// I/O errors are expected on peer disconnect and are not surfaced to
    /// the user exception callback.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Close status code to send for this error, if it maps to one
    pub(crate) fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(_) => Some(CloseCode::ProtocolError),
            Error::UnexpectedFrame => Some(CloseCode::InvalidPayloadData),
            Error::InvalidUtf8 => Some(CloseCode::InvalidPayloadData),
            Error::MessageTooLarge => Some(CloseCode::MessageTooBig),
            Error::Compression(_) => Some(CloseCode::InvalidPayloadData),
            _ => None,
        }
    }
}

/// RFC 6455 close status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// 1000: normal closure
    NormalClosure = 1000,
    /// 1001: endpoint is going away
    EndpointUnavailable = 1001,
    /// 1002: protocol error
    ProtocolError = 1002,
    /// 1003: unsupported message type
    InvalidMessageType = 1003,
    /// 1005: no status present (never sent on the wire)
    Empty = 1005,
    /// 1007: payload inconsistent with message type
    InvalidPayloadData = 1007,
    /// 1008: policy violation
    PolicyViolation = 1008,
    /// 1009: message too big
    MessageTooBig = 1009,
    /// 1010: mandatory extension missing
    MandatoryExtension = 1010,
    /// 1011: internal server error
    InternalServerError = 1011,
}

impl CloseCode {
    /// Numeric status code
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Check if a close code is valid to appear on the wire per RFC 6455
    pub fn is_valid_wire_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_classification() {
        let io = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_io());
        assert!(!Error::Protocol("bad opcode").is_io());
    }

    #[test]
    fn close_code_mapping() {
        assert_eq!(
            Error::MessageTooLarge.close_code(),
            Some(CloseCode::MessageTooBig)
        );
        assert_eq!(
            Error::InvalidUtf8.close_code(),
            Some(CloseCode::InvalidPayloadData)
        );
        assert!(Error::ReceiveInProgress.close_code().is_none());
    }

    #[test]
    fn wire_code_validity() {
        assert!(CloseCode::is_valid_wire_code(1000));
        assert!(CloseCode::is_valid_wire_code(4999));
        assert!(!CloseCode::is_valid_wire_code(1005));
        assert!(!CloseCode::is_valid_wire_code(1006));
        assert!(!CloseCode::is_valid_wire_code(2999));
    }

    #[test]
    fn code_values() {
        assert_eq!(CloseCode::NormalClosure.as_u16(), 1000);
        assert_eq!(CloseCode::MessageTooBig.as_u16(), 1009);
        assert_eq!(u16::from(CloseCode::InternalServerError), 1011);
    }
}
