//! Server side of the datagram transport.
//!
//! Every datagram is an independent call. Replies and undecodable datagrams
//! are dropped, retransmissions of recently answered calls are answered from
//! the duplicate request cache, and socket errors are reported without
//! taking the transport down.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::dispatch::{bind_reply_xid, reply_channel, CallContext, Dispatch};
use crate::dup_cache::{DuplicateCacheStats, SharedDuplicateCache};
use crate::error::{Result, RpcError};
use crate::message::{read_xid, CallCodec, Direction, RpcMessageCodec, XID_LEN};
use crate::registry::Registration;

/// What became of one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// The handler ran and its reply was sent.
    Replied,
    /// The reply came from the duplicate cache; the handler did not run.
    Replayed,
    /// The handler declined to answer.
    Declined,
    /// The datagram was a reply or not a decodable call and was ignored.
    Dropped,
}

/// A datagram socket serving calls.
pub struct DatagramTransport<C = RpcMessageCodec> {
    socket: UdpSocket,
    codec: C,
    cache: SharedDuplicateCache,
    buf: Vec<u8>,
    registration: Option<Registration>,
}

impl DatagramTransport<RpcMessageCodec> {
    /// Serves calls decoded with the standard call header codec.
    pub fn new(socket: UdpSocket, config: &TransportConfig) -> Result<Self> {
        Self::with_codec(socket, RpcMessageCodec, config)
    }

    /// Binds a socket and serves calls on it.
    pub async fn bind(addr: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(RpcError::from_io)?;
        Self::new(socket, config)
    }
}

impl<C: CallCodec> DatagramTransport<C> {
    /// Serves calls decoded with `codec`.
    pub fn with_codec(socket: UdpSocket, codec: C, config: &TransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            socket,
            codec,
            cache: SharedDuplicateCache::new(
                config.duplicate_cache_capacity,
                config.duplicate_key_mode,
            ),
            buf: vec![0; config.read_chunk_size()],
            registration: None,
        })
    }

    /// Ties the transport to its registry entry.
    pub fn attach(&mut self, registration: Registration) {
        self.registration = Some(registration);
    }

    /// The registry entry, if attached.
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Duplicate cache counters.
    pub fn cache_stats(&self) -> DuplicateCacheStats {
        self.cache.stats()
    }

    /// Waits for one datagram and handles it.
    ///
    /// Socket errors are returned; the transport remains usable afterwards.
    pub async fn recv_and_dispatch(
        &mut self,
        dispatcher: &dyn Dispatch,
    ) -> Result<DatagramOutcome> {
        let (n, from) = self.socket.recv_from(&mut self.buf).await?;
        if let Some(registration) = &self.registration {
            registration.touch();
        }
        let datagram = Bytes::copy_from_slice(&self.buf[..n]);
        self.handle_datagram(datagram, from, dispatcher).await
    }

    /// Handles one received datagram.
    pub async fn handle_datagram(
        &self,
        datagram: Bytes,
        from: SocketAddr,
        dispatcher: &dyn Dispatch,
    ) -> Result<DatagramOutcome> {
        if datagram.len() < XID_LEN {
            debug!(%from, len = datagram.len(), "dropping runt datagram");
            return Ok(DatagramOutcome::Dropped);
        }
        if Direction::of(&datagram) == Some(Direction::Reply) {
            debug!(%from, xid = read_xid(&datagram), "dropping reply sent to a server");
            return Ok(DatagramOutcome::Dropped);
        }
        let header = match self.codec.decode_call(&datagram) {
            Ok(header) => header,
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable datagram");
                return Ok(DatagramOutcome::Dropped);
            }
        };

        if let Some(cached) = self.cache.lookup(&header, from, &datagram) {
            trace!(xid = header.xid, %from, "replaying cached reply");
            self.socket.send_to(&cached, from).await?;
            return Ok(DatagramOutcome::Replayed);
        }

        let (tx, pending) = reply_channel(header.xid);
        dispatcher.dispatch(
            CallContext {
                header,
                request: datagram.clone(),
                peer: Some(from),
            },
            tx,
        );
        let Some(reply) = pending.recv().await else {
            trace!(xid = header.xid, %from, "handler declined");
            return Ok(DatagramOutcome::Declined);
        };
        let reply = match bind_reply_xid(reply, header.xid) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(xid = header.xid, %from, error = %e, "dropping malformed reply");
                return Ok(DatagramOutcome::Declined);
            }
        };
        self.cache.insert(&header, from, &datagram, reply.clone());
        self.socket.send_to(&reply, from).await?;
        Ok(DatagramOutcome::Replied)
    }
}

impl<C> std::fmt::Debug for DatagramTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramTransport")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("cached", &self.cache.len())
            .finish()
    }
}
