//! Client side of a connected stream transport.
//!
//! One connection may carry several logical client handles (one per
//! program/version, see [`StreamClient::with_program`]). They share the
//! socket and its record state behind an async mutex, so a call owns the
//! connection from the first request byte to the last reply byte and other
//! callers queue behind it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::call::deadline_after;
use crate::cancel::CancelToken;
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::message::{encode_call, read_xid, write_xid, XidGenerator};
use crate::record::{RecordReader, RecordWriter};

/// Connection state shared by every handle on one socket.
struct Channel<S> {
    io: S,
    reader: RecordReader,
    writer: RecordWriter,
    out: BytesMut,
    read_buf: Vec<u8>,
    dead: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Channel<S> {
    /// Writes buffered output. Bytes left behind by an interrupted call are
    /// written first, so a record is never cut short on the wire.
    async fn flush(&mut self) -> Result<()> {
        while !self.out.is_empty() {
            let n = self.io.write(&self.out).await?;
            if n == 0 {
                return Err(RpcError::ConnectionReset);
            }
            self.out.advance(n);
        }
        self.io.flush().await?;
        Ok(())
    }

    async fn send(&mut self, message: &[u8]) -> Result<()> {
        self.writer.write_record(message, &mut self.out)?;
        self.flush().await
    }

    async fn read_record(&mut self) -> Result<Bytes> {
        loop {
            if let Some(record) = self.reader.next_record()? {
                return Ok(record);
            }
            let n = self.io.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(RpcError::ConnectionReset);
            }
            self.reader.extend_input(&self.read_buf[..n]);
        }
    }

    /// Reads records until one carries `xid`. Replies to earlier calls that
    /// gave up waiting are skipped.
    async fn recv_reply(&mut self, xid: u32) -> Result<Bytes> {
        loop {
            let record = self.read_record().await?;
            match read_xid(&record) {
                Some(got) if got == xid => return Ok(record),
                got => debug!(xid, got = ?got, len = record.len(), "discarding stale reply"),
            }
        }
    }

    async fn exchange(
        &mut self,
        xid: u32,
        message: &[u8],
        want_reply: bool,
    ) -> Result<Option<Bytes>> {
        if self.dead {
            return Err(RpcError::Disconnected);
        }
        let result = async {
            self.send(message).await?;
            if want_reply {
                self.recv_reply(xid).await.map(Some)
            } else {
                Ok(None)
            }
        }
        .await;
        if let Err(e) = &result {
            if e.is_fatal_to_stream() {
                warn!(xid, error = %e, "stream client connection died");
                self.dead = true;
            }
        }
        result
    }
}

/// A logical RPC client over a connected byte stream.
pub struct StreamClient<S = TcpStream> {
    channel: Arc<Mutex<Channel<S>>>,
    xids: Arc<XidGenerator>,
    server_addr: Option<SocketAddr>,
    prog: u32,
    vers: u32,
    timeout: Duration,
}

impl StreamClient<TcpStream> {
    /// Connects to `addr` within the configured connect timeout.
    pub async fn connect(
        addr: SocketAddr,
        prog: u32,
        vers: u32,
        config: &TransportConfig,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })?
            .map_err(RpcError::from_io)?;
        stream.set_nodelay(true)?;
        debug!(%addr, prog, vers, "stream client connected");
        let mut client = Self::new(stream, prog, vers, config)?;
        client.server_addr = Some(addr);
        Ok(client)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamClient<S> {
    /// Wraps an already connected stream.
    pub fn new(io: S, prog: u32, vers: u32, config: &TransportConfig) -> Result<Self> {
        config.validate()?;
        let channel = Channel {
            io,
            reader: RecordReader::from_config(config),
            writer: RecordWriter::from_config(config),
            out: BytesMut::new(),
            read_buf: vec![0; config.read_chunk_size()],
            dead: false,
        };
        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
            xids: Arc::new(XidGenerator::new()),
            server_addr: None,
            prog,
            vers,
            timeout: config.total_call_timeout,
        })
    }

    /// Another handle on the same connection for a different program or
    /// version. Calls through either handle are serialised.
    pub fn with_program(&self, prog: u32, vers: u32) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            xids: Arc::clone(&self.xids),
            server_addr: self.server_addr,
            prog,
            vers,
            timeout: self.timeout,
        }
    }

    /// Total time a call waits for its reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the total call timeout. Zero means "send and do not wait".
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Transaction id the next call will use.
    pub fn xid(&self) -> u32 {
        self.xids.peek()
    }

    /// Sets the transaction id the next call will use.
    pub fn set_xid(&self, xid: u32) {
        self.xids.set_next(xid);
    }

    /// Program number of this handle.
    pub fn prog(&self) -> u32 {
        self.prog
    }

    /// Sets the program number.
    pub fn set_prog(&mut self, prog: u32) {
        self.prog = prog;
    }

    /// Program version of this handle.
    pub fn vers(&self) -> u32 {
        self.vers
    }

    /// Sets the program version.
    pub fn set_vers(&mut self, vers: u32) {
        self.vers = vers;
    }

    /// Address of the server, when connected through [`StreamClient::connect`].
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Returns `true` once a fatal error has destroyed the connection.
    pub async fn is_dead(&self) -> bool {
        self.channel.lock().await.dead
    }

    /// Calls `proc` with already-encoded arguments and returns the whole
    /// reply message.
    pub async fn call(&self, proc: u32, args: &[u8]) -> Result<Bytes> {
        self.call_with_cancel(proc, args, &CancelToken::never()).await
    }

    /// Like [`call`](Self::call), aborting with `Cancelled` once `cancel`
    /// fires.
    pub async fn call_with_cancel(
        &self,
        proc: u32,
        args: &[u8],
        cancel: &CancelToken,
    ) -> Result<Bytes> {
        let xid = self.xids.next_xid();
        let message = encode_call(xid, self.prog, self.vers, proc, args);
        self.run(xid, &message, true, cancel).await?.ok_or(RpcError::Timeout {
            xid,
            timeout_ms: 0,
        })
    }

    /// Sends a complete call message produced by an external codec. Its
    /// first four bytes are overwritten with a fresh transaction id.
    pub async fn call_message(&self, message: &[u8], cancel: &CancelToken) -> Result<Bytes> {
        let xid = self.xids.next_xid();
        let mut owned = BytesMut::from(message);
        write_xid(&mut owned, xid)?;
        self.run(xid, &owned, true, cancel).await?.ok_or(RpcError::Timeout {
            xid,
            timeout_ms: 0,
        })
    }

    /// Sends a call whose reply the caller does not need. With a zero
    /// timeout this returns as soon as the request is written; otherwise it
    /// waits for the reply and discards it.
    pub async fn call_batched(&self, proc: u32, args: &[u8]) -> Result<()> {
        let xid = self.xids.next_xid();
        let message = encode_call(xid, self.prog, self.vers, proc, args);
        let want_reply = !self.timeout.is_zero();
        self.run(xid, &message, want_reply, &CancelToken::never())
            .await
            .map(|_| ())
    }

    async fn run(
        &self,
        xid: u32,
        message: &[u8],
        want_reply: bool,
        cancel: &CancelToken,
    ) -> Result<Option<Bytes>> {
        let timeout = self.timeout;
        if timeout.is_zero() {
            // Send without a deadline, never read.
            let send = async {
                let mut channel = self.channel.lock().await;
                channel.exchange(xid, message, false).await
            };
            tokio::select! {
                biased;
                reason = cancel.cancelled() => return Err(RpcError::Cancelled { xid, reason }),
                sent = send => sent?,
            };
            return if want_reply {
                Err(RpcError::Timeout { xid, timeout_ms: 0 })
            } else {
                Ok(None)
            };
        }

        let deadline = deadline_after(Instant::now(), timeout);
        let work = async {
            let mut channel = self.channel.lock().await;
            channel.exchange(xid, message, want_reply).await
        };
        tokio::select! {
            biased;
            reason = cancel.cancelled() => Err(RpcError::Cancelled { xid, reason }),
            res = tokio::time::timeout_at(deadline, work) => match res {
                Ok(reply) => reply,
                Err(_) => {
                    debug!(xid, ?timeout, "stream call timed out");
                    Err(RpcError::Timeout {
                        xid,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            },
        }
    }
}

impl<S> Clone for StreamClient<S> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            xids: Arc::clone(&self.xids),
            server_addr: self.server_addr,
            prog: self.prog,
            vers: self.vers,
            timeout: self.timeout,
        }
    }
}

impl<S> std::fmt::Debug for StreamClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("server_addr", &self.server_addr)
            .field("prog", &self.prog)
            .field("vers", &self.vers)
            .field("timeout", &self.timeout)
            .finish()
    }
}
