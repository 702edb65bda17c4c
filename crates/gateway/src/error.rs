//! Error types for the gateway
//!
//! Startup and configuration paths use `anyhow`; the per-message and
//! per-connection paths below are typed so callers can decide whether a
//! failure abandons a datagram, a connection, or nothing at all.

use std::io;

/// Malformed bytes on the wire.
///
/// Never fatal to the process: a datagram is dropped, a device session
/// skips the frame (or aborts if it was the registration frame).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Zero-length message
    #[error("empty message")]
    Empty,

    /// Leading type byte is not a known message type
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    /// Known type, but not the one the caller expected here
    #[error("expected message type {expected:#04x}, got {actual:#04x}")]
    UnexpectedType {
        /// Type byte the caller asked for
        expected: u8,
        /// Type byte found on the wire
        actual: u8,
    },

    /// CBOR payload did not match the message shape
    #[error("malformed {kind} payload: {source}")]
    Payload {
        /// Message name, for log lines
        kind: &'static str,
        #[source]
        source: serde_cbor::Error,
    },

    /// Payload decoded but a field is unusable
    #[error("invalid {kind}: {reason}")]
    InvalidField {
        /// Message name
        kind: &'static str,
        /// What was wrong
        reason: &'static str,
    },

    /// TCP frame header announced more bytes than we accept
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },
}

/// Failure reported by the command relay to its caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// No live session for this device id
    #[error("Device {0} is not connected.")]
    DeviceNotConnected(String),

    /// Session is alive but its outbound queue is full
    #[error("Device {0} has too many pending commands.")]
    SessionBacklogged(String),
}

/// Terminal condition of one TCP session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Socket error, including resets and truncated frames
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bytes that cannot be decoded where decoding is mandatory
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Peer connected but never sent its first frame
    #[error("no message received within {0:?}")]
    RegistrationTimeout(std::time::Duration),
}

impl SessionError {
    /// Peer went away (reset, abort, truncated frame) rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_messages() {
        let err = RelayError::DeviceNotConnected("lamp_01".to_string());
        assert_eq!(err.to_string(), "Device lamp_01 is not connected.");
    }

    #[test]
    fn test_disconnect_classification() {
        let reset = SessionError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());

        let eof = SessionError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(eof.is_disconnect());

        let decode = SessionError::Decode(DecodeError::Empty);
        assert!(!decode.is_disconnect());
    }
}
