//! Error types and result aliases.
//!
//! Transport and protocol failures are handled at the boundary where they
//! are detected (reactor callback, replication loop) and never unwound
//! through the storage engine, which has no fallible operations.

use std::io;
use thiserror::Error;

/// Result type alias for arca operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for arca.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Replication session errors
    #[error("replication error: {0}")]
    Replication(#[from] ReplError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Protocol-level errors during frame decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame or field length exceeds the configured maximum
    #[error("frame too large: {len} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared length in bytes
        len: u64,
        /// Maximum allowed length
        max: usize,
    },

    /// A declared field length does not fit the frame it came in
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required by the declared lengths
        need: usize,
        /// Bytes actually present
        have: usize,
    },

    /// A key or value length of zero (every field carries at least its NUL)
    #[error("invalid field length: 0")]
    EmptyField,

    /// A field is not NUL-terminated where the frame layout requires it
    #[error("missing NUL terminator")]
    MissingNul,
}

/// Replication-session errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplError {
    /// Handshake answered with an unexpected status
    #[error("handshake status mismatch: expected {expected}, got {got}")]
    StatusMismatch {
        /// Status we required in this round-trip
        expected: u32,
        /// Status the peer actually sent
        got: u32,
    },

    /// A status packet carried an undefined status value
    #[error("unknown replication status: {0}")]
    UnknownStatus(u32),

    /// The peer closed the link mid-exchange
    #[error("replication link closed by peer")]
    LinkClosed,

    /// The session reached the `Null` state and must be torn down
    #[error("replication session aborted")]
    Aborted,
}

impl Error {
    /// Returns true if this error should terminate only the affected
    /// connection, never the process.
    #[inline]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Replication(_) | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Protocol(ProtocolError::Truncated { need: 32, have: 7 });
        assert_eq!(
            err.to_string(),
            "protocol error: truncated frame: need 32 bytes, have 7"
        );
    }

    #[test]
    fn test_repl_error_display() {
        let err = ReplError::StatusMismatch {
            expected: 3,
            got: 8,
        };
        assert_eq!(
            err.to_string(),
            "handshake status mismatch: expected 3, got 8"
        );
    }

    #[test]
    fn test_connection_fatal_classification() {
        let conn_err = Error::Replication(ReplError::LinkClosed);
        assert!(conn_err.is_connection_fatal());

        let config_err = Error::Config("bad directive".to_string());
        assert!(!config_err.is_connection_fatal());
    }
}
