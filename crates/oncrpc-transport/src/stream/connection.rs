//! Server side of a connected stream transport.
//!
//! A [`StreamTransport`] owns one connected socket, a [`RecordReader`] that
//! survives partial reads between readiness notifications, and an output
//! buffer of framed replies waiting for the socket to drain.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::io::{write_available, StreamIo};
use crate::record::{RecordReader, RecordWriter};
use crate::registry::Registration;

/// Whether reads wait for data or report would-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Reads wait; an end of stream is always a premature close.
    Blocking,
    /// Reads return `Ok(None)` when no complete record is available.
    NonBlocking,
}

impl IoMode {
    /// Mode selected by a configuration.
    pub fn from_config(config: &TransportConfig) -> Self {
        if config.nonblocking {
            IoMode::NonBlocking
        } else {
            IoMode::Blocking
        }
    }
}

/// Status of a transport between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStat {
    /// A fatal error occurred; the transport must be destroyed.
    Died,
    /// Bytes of a further record are already buffered.
    MoreRequests,
    /// Nothing is buffered.
    Idle,
}

/// Counts bytes moved through a [`StreamIo`].
struct Counted<'a, S: ?Sized> {
    inner: &'a mut S,
    read: usize,
}

impl<S: StreamIo + ?Sized> StreamIo for Counted<'_, S> {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read_some(buf)?;
        self.read += n;
        Ok(n)
    }

    fn write_some(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write_some(buf)
    }
}

/// One connected stream carrying records in both directions.
pub struct StreamTransport<S> {
    io: S,
    reader: RecordReader,
    writer: RecordWriter,
    out: BytesMut,
    mode: IoMode,
    peer: Option<SocketAddr>,
    last_activity: Instant,
    died: bool,
    // Declared after `io`: the socket is closed before the registry sees the
    // registration released.
    registration: Option<Registration>,
}

impl<S: StreamIo> StreamTransport<S> {
    /// Wraps a connected socket. Buffer sizes and mode come from `config`.
    pub fn new(io: S, config: &TransportConfig, peer: Option<SocketAddr>) -> Self {
        Self {
            io,
            reader: RecordReader::from_config(config),
            writer: RecordWriter::from_config(config),
            out: BytesMut::new(),
            mode: IoMode::from_config(config),
            peer,
            last_activity: Instant::now(),
            died: false,
            registration: None,
        }
    }

    /// Ties the transport to its registry entry; activity is reported there
    /// and the entry is removed when the transport is dropped.
    pub fn attach(&mut self, registration: Registration) {
        registration.touch();
        self.registration = Some(registration);
    }

    /// The registry entry, if attached.
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Reads whatever is available and returns the next complete record.
    ///
    /// `Ok(None)` means no complete record yet; already-read bytes are kept.
    /// Any error other than would-block marks the transport dead.
    pub fn recv(&mut self) -> Result<Option<Bytes>> {
        if self.died {
            return Err(RpcError::Disconnected);
        }
        let mut counted = Counted {
            inner: &mut self.io,
            read: 0,
        };
        let result = self.reader.poll_record(&mut counted);
        if counted.read > 0 {
            self.touch();
        }
        match result {
            Ok(record) => {
                if let Some(record) = &record {
                    debug!(peer = ?self.peer, len = record.len(), "record received");
                }
                Ok(record)
            }
            Err(RpcError::Disconnected) if self.mode == IoMode::Blocking => {
                Err(self.fail(RpcError::ConnectionReset))
            }
            Err(e) if e.is_fatal_to_stream() => Err(self.fail(e)),
            Err(e) => Err(e),
        }
    }

    fn fail(&mut self, err: RpcError) -> RpcError {
        self.died = true;
        match &err {
            RpcError::Disconnected => debug!(peer = ?self.peer, "peer closed connection"),
            e => warn!(peer = ?self.peer, error = %e, "stream transport died"),
        }
        err
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if let Some(registration) = &self.registration {
            registration.touch();
        }
    }

    /// Frames `reply` into the output buffer. Nothing is written until
    /// [`flush`](Self::flush).
    pub fn queue_reply(&mut self, reply: &[u8]) -> Result<()> {
        if self.died {
            return Err(RpcError::Disconnected);
        }
        self.writer.write_record(reply, &mut self.out)?;
        Ok(())
    }

    /// Writes as much buffered output as the socket accepts. Returns `true`
    /// once the buffer is empty.
    pub fn flush(&mut self) -> Result<bool> {
        if self.died {
            return Err(RpcError::Disconnected);
        }
        match write_available(&mut self.io, &self.out) {
            Ok(n) => {
                self.out.advance(n);
                Ok(self.out.is_empty())
            }
            Err(e) => Err(self.fail(RpcError::Io(e))),
        }
    }

    /// Frames and writes a reply, waiting for the socket only in blocking
    /// mode. Returns `true` if everything was written.
    pub fn send(&mut self, reply: &[u8]) -> Result<bool> {
        self.queue_reply(reply)?;
        self.flush()
    }

    /// Bytes framed but not yet written.
    pub fn pending_output(&self) -> usize {
        self.out.len()
    }

    /// Status between records.
    pub fn stat(&self) -> TransportStat {
        if self.died {
            TransportStat::Died
        } else if self.reader.has_buffered_input() {
            TransportStat::MoreRequests
        } else {
            TransportStat::Idle
        }
    }

    /// Returns `true` after a fatal error.
    pub fn is_dead(&self) -> bool {
        self.died
    }

    /// When a read last returned data.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time since a read last returned data.
    pub fn idle_time(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity)
    }

    /// Remote address, if known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Read mode.
    pub fn mode(&self) -> IoMode {
        self.mode
    }

    /// The underlying socket.
    pub fn get_ref(&self) -> &S {
        &self.io
    }

    /// The underlying socket, mutably.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }
}

impl StreamTransport<std::net::TcpStream> {
    /// Wraps a std TCP stream, switching it to the configured mode.
    pub fn from_std(stream: std::net::TcpStream, config: &TransportConfig) -> Result<Self> {
        stream.set_nonblocking(config.nonblocking)?;
        let peer = stream.peer_addr().ok();
        Ok(Self::new(stream, config, peer))
    }
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("peer", &self.peer)
            .field("mode", &self.mode)
            .field("reader", &self.reader)
            .field("pending_output", &self.out.len())
            .field("died", &self.died)
            .finish()
    }
}
