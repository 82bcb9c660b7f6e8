//! Client side of the datagram transport.
//!
//! Each call sends one datagram and retransmits it on the backoff schedule
//! of its [`CallMatcher`] until a datagram carrying the same xid comes back
//! or the total deadline passes. Handles created with
//! [`DatagramClient::with_program`] share the socket; a call holds it
//! exclusively for its whole exchange.
//!
//! By default a reply is only accepted from the address the call was sent
//! to, compared after unmapping IPv4-mapped IPv6 addresses. Clients talking
//! to multi-homed servers can turn that check off with
//! [`DatagramClient::set_source_check`] and match on the xid alone.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::call::{CallMatcher, CallState, TimerAction};
use crate::cancel::{CancelReason, CancelToken};
use crate::config::{CallTiming, TransportConfig};
use crate::error::{Result, RpcError};
use crate::message::{encode_call, write_xid, XidGenerator};

/// Retry delay for a retransmission the socket had no room for.
const SEND_BLOCKED_RETRY: Duration = Duration::from_millis(20);

struct Socket {
    socket: UdpSocket,
    buf: Vec<u8>,
}

/// A logical RPC client over a datagram socket.
pub struct DatagramClient {
    socket: Arc<Mutex<Socket>>,
    xids: Arc<XidGenerator>,
    server_addr: SocketAddr,
    prog: u32,
    vers: u32,
    timing: CallTiming,
    check_source: bool,
}

impl DatagramClient {
    /// Binds an ephemeral local socket of the server's address family.
    pub async fn bind(
        server_addr: SocketAddr,
        prog: u32,
        vers: u32,
        config: &TransportConfig,
    ) -> Result<Self> {
        let local: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await.map_err(RpcError::from_io)?;
        Self::new(socket, server_addr, prog, vers, config)
    }

    /// Uses an existing socket to talk to `server_addr`.
    pub fn new(
        socket: UdpSocket,
        server_addr: SocketAddr,
        prog: u32,
        vers: u32,
        config: &TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        let socket = Socket {
            socket,
            buf: vec![0; config.read_chunk_size()],
        };
        Ok(Self {
            socket: Arc::new(Mutex::new(socket)),
            xids: Arc::new(XidGenerator::new()),
            server_addr,
            prog,
            vers,
            timing: config.call_timing(),
            check_source: true,
        })
    }

    /// Another handle on the same socket for a different program or version.
    pub fn with_program(&self, prog: u32, vers: u32) -> Self {
        Self {
            socket: Arc::clone(&self.socket),
            xids: Arc::clone(&self.xids),
            server_addr: self.server_addr,
            prog,
            vers,
            timing: self.timing,
            check_source: self.check_source,
        }
    }

    /// Total time a call waits for its reply.
    pub fn timeout(&self) -> Duration {
        self.timing.total_timeout
    }

    /// Sets the total call timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timing.total_timeout = timeout;
    }

    /// Delay before the first retransmission.
    pub fn retry_wait(&self) -> Duration {
        self.timing.initial_wait
    }

    /// Sets the delay before the first retransmission.
    pub fn set_retry_wait(&mut self, wait: Duration) {
        self.timing.initial_wait = wait;
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

    /// Whether replies must come from the server's address.
    pub fn checks_source(&self) -> bool {
        self.check_source
    }

    /// Sets whether replies must come from the server's address. When off,
    /// any datagram carrying the call's xid is taken as its reply.
    pub fn set_source_check(&mut self, check: bool) {
        self.check_source = check;
    }

    /// Where calls are sent.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Local address of the socket.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.lock().await.socket.local_addr()?)
    }

    /// Sends a call and returns a handle to poll for its reply. The handle
    /// owns the socket until it is dropped.
    pub async fn start_call(&self, proc: u32, args: &[u8]) -> Result<PendingCall> {
        let xid = self.xids.next_xid();
        let request = encode_call(xid, self.prog, self.vers, proc, args);
        self.start(xid, request, CancelToken::never()).await
    }

    async fn start(
        &self,
        xid: u32,
        request: Bytes,
        cancel: CancelToken,
    ) -> Result<PendingCall> {
        let socket = Arc::clone(&self.socket).lock_owned().await;
        socket.socket.send_to(&request, self.server_addr).await?;
        trace!(xid, dest = %self.server_addr, len = request.len(), "datagram call sent");
        let matcher = CallMatcher::new(xid, self.server_addr, &self.timing, Instant::now());
        Ok(PendingCall {
            socket,
            matcher,
            request,
            token: cancel,
            cancel_reason: None,
            reply: None,
            check_source: self.check_source,
        })
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
        let request = encode_call(xid, self.prog, self.vers, proc, args);
        self.run(xid, request, cancel).await
    }

    /// Sends a complete call message produced by an external codec. Its
    /// first four bytes are overwritten with a fresh transaction id.
    pub async fn call_message(&self, message: &[u8], cancel: &CancelToken) -> Result<Bytes> {
        let xid = self.xids.next_xid();
        let mut owned = BytesMut::from(message);
        write_xid(&mut owned, xid)?;
        self.run(xid, owned.freeze(), cancel).await
    }

    async fn run(&self, xid: u32, request: Bytes, cancel: &CancelToken) -> Result<Bytes> {
        if let Some(reason) = cancel.cancelled_reason() {
            return Err(RpcError::Cancelled { xid, reason });
        }
        let mut pending = self.start(xid, request, cancel.clone()).await?;
        if self.timing.total_timeout.is_zero() {
            return Err(RpcError::Timeout { xid, timeout_ms: 0 });
        }
        pending.wait().await
    }
}

impl Clone for DatagramClient {
    fn clone(&self) -> Self {
        self.with_program(self.prog, self.vers)
    }
}

impl std::fmt::Debug for DatagramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramClient")
            .field("server_addr", &self.server_addr)
            .field("prog", &self.prog)
            .field("vers", &self.vers)
            .field("timing", &self.timing)
            .field("check_source", &self.check_source)
            .finish()
    }
}

/// A call in flight. Polling never waits; [`wait`](Self::wait) suspends
/// between polls.
pub struct PendingCall {
    socket: OwnedMutexGuard<Socket>,
    matcher: CallMatcher,
    request: Bytes,
    token: CancelToken,
    cancel_reason: Option<CancelReason>,
    reply: Option<Bytes>,
    check_source: bool,
}

impl PendingCall {
    /// Transaction id of the call.
    pub fn xid(&self) -> u32 {
        self.matcher.xid()
    }

    /// Transmissions so far.
    pub fn attempts(&self) -> u32 {
        self.matcher.attempts()
    }

    /// State of the call.
    pub fn state(&self) -> CallState {
        self.matcher.state()
    }

    /// When the caller should poll again at the latest.
    pub fn next_wakeup(&self) -> Instant {
        self.matcher.next_wakeup()
    }

    /// Aborts the call; the next poll reports `Cancelled`.
    pub fn cancel(&mut self, reason: CancelReason) {
        if !self.matcher.state().is_finished() {
            self.cancel_reason = Some(reason);
            self.matcher.cancel();
        }
    }

    /// Drains received datagrams, retransmits if the timer is due, and
    /// reports the outcome without waiting.
    ///
    /// `Ok(None)` means the reply has not arrived yet. Datagrams with another
    /// xid are discarded, as are datagrams from other addresses unless the
    /// source check is off. A retransmission the socket cannot take right
    /// now is retried shortly after. Socket errors are returned but leave the
    /// call usable.
    pub fn poll_reply(&mut self) -> Result<Option<Bytes>> {
        if let Some(reply) = &self.reply {
            return Ok(Some(reply.clone()));
        }
        if let Some(reason) = self.token.cancelled_reason() {
            self.cancel(reason);
        }
        if !self.matcher.state().is_finished() {
            if let Some(reply) = self.drain()? {
                self.reply = Some(reply.clone());
                return Ok(Some(reply));
            }
        }

        let now = Instant::now();
        match self.matcher.poll_timer(now) {
            TimerAction::WaitUntil(_) => Ok(None),
            TimerAction::Retransmit => {
                let dest = self.matcher.dest();
                match self.socket.socket.try_send_to(&self.request, dest) {
                    Ok(_) => {
                        self.matcher.on_retransmit(now);
                        debug!(
                            xid = self.matcher.xid(),
                            attempts = self.matcher.attempts(),
                            backoff = ?self.matcher.current_backoff(),
                            "retransmitted datagram call"
                        );
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        trace!(xid = self.matcher.xid(), "send buffer full, retransmit deferred");
                        self.matcher.defer_retransmit(now, SEND_BLOCKED_RETRY);
                    }
                    Err(e) => {
                        self.matcher.defer_retransmit(now, SEND_BLOCKED_RETRY);
                        return Err(RpcError::Io(e));
                    }
                }
                Ok(None)
            }
            TimerAction::GiveUp => Err(self.terminal_error()),
        }
    }

    fn drain(&mut self) -> Result<Option<Bytes>> {
        let socket = &mut *self.socket;
        loop {
            match socket.socket.try_recv_from(&mut socket.buf) {
                Ok((n, from)) => {
                    let datagram = &socket.buf[..n];
                    if self.check_source && !same_endpoint(from, self.matcher.dest()) {
                        debug!(%from, len = n, "discarding datagram from unexpected address");
                        continue;
                    }
                    if self.matcher.accept(datagram) {
                        return Ok(Some(Bytes::copy_from_slice(datagram)));
                    }
                    debug!(
                        xid = self.matcher.xid(),
                        len = n,
                        "discarding datagram with foreign xid"
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RpcError::Io(e)),
            }
        }
    }

    fn terminal_error(&self) -> RpcError {
        let xid = self.matcher.xid();
        match self.matcher.state() {
            CallState::Cancelled => RpcError::Cancelled {
                xid,
                reason: self.cancel_reason.unwrap_or_default(),
            },
            _ => RpcError::Timeout {
                xid,
                timeout_ms: self.matcher.total_timeout().as_millis() as u64,
            },
        }
    }

    /// Polls until the reply arrives, the deadline passes or the call is
    /// cancelled, sleeping on socket readiness and the retransmit timer in
    /// between.
    pub async fn wait(&mut self) -> Result<Bytes> {
        loop {
            match self.poll_reply() {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {}
                Err(RpcError::Io(e)) => {
                    // ICMP errors and the like do not end a datagram call.
                    debug!(xid = self.xid(), error = %e, "datagram socket error");
                }
                Err(e) => return Err(e),
            }
            let wake = self.matcher.next_wakeup();
            tokio::select! {
                biased;
                reason = self.token.cancelled() => self.cancel(reason),
                ready = self.socket.socket.readable() => {
                    if let Err(e) = ready {
                        return Err(RpcError::Io(e));
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

/// Address equality that treats `::ffff:a.b.c.d` and `a.b.c.d` as the same.
fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && a.ip().to_canonical() == b.ip().to_canonical()
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("matcher", &self.matcher)
            .field("has_reply", &self.reply.is_some())
            .field("check_source", &self.check_source)
            .finish()
    }
}
