//! Error types for the RPC transport runtime.

use std::io;

use thiserror::Error;

use crate::cancel::CancelReason;

/// Errors surfaced by record marking, stream and datagram transports.
///
/// Use [`is_retryable`](Self::is_retryable) and
/// [`is_fatal_to_stream`](Self::is_fatal_to_stream) rather than matching on
/// message text.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed framing: zero-length non-terminal fragment, oversized
    /// record, truncated header.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What was wrong with the bytes on the wire.
        reason: String,
    },

    /// The peer closed or reset the stream in the middle of a record.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The peer closed the stream at a record boundary, or the transport was
    /// already torn down.
    #[error("peer disconnected")]
    Disconnected,

    /// A call's total deadline elapsed without a matching reply.
    #[error("call 0x{xid:08x} timed out after {timeout_ms}ms")]
    Timeout {
        /// Transaction id of the call that timed out.
        xid: u32,
        /// Configured total timeout.
        timeout_ms: u64,
    },

    /// The caller aborted an in-flight call.
    #[error("call 0x{xid:08x} cancelled: {reason}")]
    Cancelled {
        /// Transaction id of the cancelled call.
        xid: u32,
        /// Why the call was cancelled.
        reason: CancelReason,
    },

    /// Descriptor or memory exhaustion that eviction could not relieve.
    #[error("resource exhausted: {reason}")]
    ResourceExhausted {
        /// Which resource ran out.
        reason: String,
    },

    /// The message could not be encoded (reported by the codec boundary).
    #[error("encode failed: {reason}")]
    EncodeFailed {
        /// Details from the encoder.
        reason: String,
    },

    /// The message could not be decoded (reported by the codec boundary).
    #[error("decode failed: {reason}")]
    DecodeFailed {
        /// Details from the decoder.
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// The offending setting.
        reason: String,
    },

    /// Socket-level error from the host environment.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RpcError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        RpcError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        RpcError::DecodeFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn encode(reason: impl Into<String>) -> Self {
        RpcError::EncodeFailed {
            reason: reason.into(),
        }
    }

    /// Maps an accept/socket error onto `ResourceExhausted` when the host ran
    /// out of descriptors, leaving every other error untouched.
    pub fn from_io(err: io::Error) -> Self {
        if is_descriptor_exhaustion(&err) {
            RpcError::ResourceExhausted {
                reason: err.to_string(),
            }
        } else {
            RpcError::Io(err)
        }
    }

    /// Returns `true` if the error is an I/O "try again later" indication.
    pub fn is_would_block(&self) -> bool {
        matches!(self, RpcError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// Returns `true` if a stream transport that produced this error must be
    /// destroyed.
    pub fn is_fatal_to_stream(&self) -> bool {
        match self {
            RpcError::ProtocolViolation { .. }
            | RpcError::ConnectionReset
            | RpcError::Disconnected
            | RpcError::ResourceExhausted { .. } => true,
            RpcError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Returns `true` if an upper layer may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Timeout { .. } => true,
            RpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }
}

/// Returns `true` for `EMFILE` / `ENFILE`.
pub fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EMFILE || code == libc::ENFILE)
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
