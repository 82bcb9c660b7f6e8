//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Default send/receive buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 8800;
/// Default largest record a stream transport will reassemble.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 4 * 1024 * 1024;
/// Default number of replies remembered by the duplicate request cache.
pub const DEFAULT_DUP_CACHE_CAPACITY: usize = 6;
/// Ceiling for the retransmission interval of datagram calls.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How the duplicate request cache identifies a retransmitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicateKeyMode {
    /// `(xid, proc, vers, prog, client_addr)`, compatible with classic servers.
    #[default]
    CallIdentity,
    /// Call identity plus a digest of the request bytes, so two different
    /// requests that collide on xid after wraparound are kept apart.
    CallIdentityAndDigest,
}

/// Options recognised by stream and datagram transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes buffered per outgoing fragment, header included.
    pub send_buffer_size: usize,
    /// Bytes requested from the socket per read.
    pub recv_buffer_size: usize,
    /// Largest record (sum of fragment payloads) accepted from a peer.
    pub max_record_size: usize,
    /// Whether server stream transports report would-block instead of
    /// waiting for a full record.
    pub nonblocking: bool,
    /// Idle time after which server connections are reaped; zero disables.
    pub idle_timeout: Duration,
    /// Upper bound of the datagram retransmission interval.
    pub max_backoff: Duration,
    /// First datagram retransmission interval.
    pub initial_backoff: Duration,
    /// Total time a client call waits for its reply.
    pub total_call_timeout: Duration,
    /// Replies remembered by a datagram server; zero disables the cache.
    pub duplicate_cache_capacity: usize,
    /// Key used by the duplicate request cache.
    pub duplicate_key_mode: DuplicateKeyMode,
    /// Time allowed for a stream client to connect.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            nonblocking: true,
            idle_timeout: Duration::ZERO,
            max_backoff: MAX_BACKOFF,
            initial_backoff: Duration::from_secs(1),
            total_call_timeout: Duration::from_secs(25),
            duplicate_cache_capacity: DEFAULT_DUP_CACHE_CAPACITY,
            duplicate_key_mode: DuplicateKeyMode::CallIdentity,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Checks that the settings are internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_record_size == 0 {
            return Err(RpcError::InvalidConfig {
                reason: "max_record_size must be non-zero".to_string(),
            });
        }
        if self.initial_backoff.is_zero() {
            return Err(RpcError::InvalidConfig {
                reason: "initial_backoff must be non-zero".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(RpcError::InvalidConfig {
                reason: format!(
                    "max_backoff {:?} is below initial_backoff {:?}",
                    self.max_backoff, self.initial_backoff
                ),
            });
        }
        Ok(())
    }

    /// Payload bytes carried by each outgoing fragment.
    pub fn fragment_payload_size(&self) -> usize {
        normalize_buffer_size(self.send_buffer_size) - crate::record::HEADER_LEN
    }

    /// Bytes requested per socket read.
    pub fn read_chunk_size(&self) -> usize {
        normalize_buffer_size(self.recv_buffer_size)
    }

    /// The per-call retry schedule derived from this configuration.
    pub fn call_timing(&self) -> CallTiming {
        CallTiming {
            initial_wait: self.initial_backoff,
            total_timeout: self.total_call_timeout,
            max_backoff: self.max_backoff,
        }
    }
}

/// Buffer sizes under 100 bytes fall back to 4000; others are rounded up to a
/// multiple of four.
pub fn normalize_buffer_size(size: usize) -> usize {
    if size < 100 {
        4000
    } else {
        size.saturating_add(3) & !3
    }
}

/// Retry schedule of a single client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTiming {
    /// Delay before the first retransmission.
    pub initial_wait: Duration,
    /// Absolute budget for the whole call.
    pub total_timeout: Duration,
    /// Cap on the retransmission interval.
    pub max_backoff: Duration,
}

impl Default for CallTiming {
    fn default() -> Self {
        TransportConfig::default().call_timing()
    }
}
