//! Server driver.
//!
//! [`RpcServer`] ties the pieces together: a rendezvous listener feeding one
//! task per connection, and a datagram loop. Readiness comes from the tokio
//! reactor; each connection task reads whatever is available, dispatches
//! complete records, and writes replies back through the same transport.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::TransportConfig;
use crate::datagram::server::{DatagramOutcome, DatagramTransport};
use crate::dispatch::{bind_reply_xid, reply_channel, CallContext, Dispatch};
use crate::error::{Result, RpcError};
use crate::message::{CallCodec, Direction, RpcMessageCodec};
use crate::registry::{CloseSignal, ConnectionKind, ConnectionRegistry};
use crate::stream::connection::StreamTransport;
use crate::stream::listener::StreamListener;

/// Pause after an accept failure before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Counters {
    active_requests: AtomicUsize,
    total_processed: AtomicU64,
    total_dropped: AtomicU64,
}

struct ActiveRequest<'a>(&'a AtomicUsize);

impl<'a> ActiveRequest<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of server counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Calls currently waiting for their handler.
    pub active_requests: usize,
    /// Calls answered, from the handler or the duplicate cache.
    pub total_processed: u64,
    /// Messages dropped as undecodable or with an unusable reply.
    pub total_dropped: u64,
    /// Transports currently registered.
    pub connections: usize,
}

/// Serves RPC calls over stream and datagram transports.
pub struct RpcServer<C = RpcMessageCodec> {
    config: TransportConfig,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<dyn Dispatch>,
    codec: C,
    counters: Arc<Counters>,
}

impl RpcServer<RpcMessageCodec> {
    /// Creates a server decoding standard call headers.
    pub fn new(config: TransportConfig, dispatcher: impl Dispatch) -> Result<Self> {
        Self::with_codec(config, RpcMessageCodec, dispatcher)
    }
}

impl<C: CallCodec + Clone> RpcServer<C> {
    /// Creates a server with a custom call header codec.
    pub fn with_codec(
        config: TransportConfig,
        codec: C,
        dispatcher: impl Dispatch,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            dispatcher: Arc::new(dispatcher),
            codec,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Registry of every transport this server owns.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Current counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_requests: self.counters.active_requests.load(Ordering::SeqCst),
            total_processed: self.counters.total_processed.load(Ordering::SeqCst),
            total_dropped: self.counters.total_dropped.load(Ordering::SeqCst),
            connections: self.registry.len(),
        }
    }

    /// Binds a rendezvous listener registered with this server.
    pub async fn bind_stream<A: ToSocketAddrs>(&self, addr: A) -> Result<StreamListener> {
        StreamListener::bind(addr, self.config.clone(), Arc::clone(&self.registry)).await
    }

    /// Accepts connections until `shutdown` fires, serving each on its own
    /// task. Connection tasks are aborted on shutdown.
    pub async fn serve_stream(
        &self,
        listener: StreamListener,
        shutdown: CancelToken,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        loop {
            while tasks.try_join_next().is_some() {}
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(transport) => {
                    tasks.spawn(drive_connection(
                        transport,
                        self.codec.clone(),
                        Arc::clone(&self.dispatcher),
                        Arc::clone(&self.counters),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        info!(connections = tasks.len(), "stream server shutting down");
        tasks.shutdown().await;
        Ok(())
    }

    /// Serves calls arriving on `socket` until `shutdown` fires.
    pub async fn serve_datagram(&self, socket: UdpSocket, shutdown: CancelToken) -> Result<()> {
        let mut transport =
            DatagramTransport::with_codec(socket, self.codec.clone(), &self.config)?;
        let local = transport.local_addr().ok();
        transport.attach(self.registry.register(ConnectionKind::Datagram, local));
        info!(addr = ?local, "datagram server started");
        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                outcome = transport.recv_and_dispatch(self.dispatcher.as_ref()) => outcome,
            };
            match outcome {
                Ok(DatagramOutcome::Replied) | Ok(DatagramOutcome::Replayed) => {
                    self.counters.total_processed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(DatagramOutcome::Dropped) => {
                    self.counters.total_dropped.fetch_add(1, Ordering::SeqCst);
                }
                Ok(DatagramOutcome::Declined) => {}
                Err(e) => debug!(error = %e, "datagram socket error"),
            }
        }
        info!(addr = ?local, "datagram server shutting down");
        Ok(())
    }
}

impl<C> std::fmt::Debug for RpcServer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("counters", &self.counters)
            .finish()
    }
}

async fn wait_closed(close: Option<&CloseSignal>) {
    match close {
        Some(close) => close.closed().await,
        None => std::future::pending().await,
    }
}

/// Reads records off one connection until it dies or the registry closes it.
async fn drive_connection<C: CallCodec>(
    mut transport: StreamTransport<TcpStream>,
    codec: C,
    dispatcher: Arc<dyn Dispatch>,
    counters: Arc<Counters>,
) {
    let close = transport.registration().map(|r| r.close_signal().clone());
    let peer = transport.peer();
    loop {
        if close.as_ref().is_some_and(CloseSignal::is_closed) {
            debug!(?peer, "connection closed by registry");
            return;
        }
        match transport.recv() {
            Ok(Some(record)) => {
                let served =
                    serve_record(&mut transport, record, &codec, dispatcher.as_ref(), &counters);
                if let Err(e) = served.await {
                    debug!(?peer, error = %e, "connection task ending");
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(_) => return,
        }
        tokio::select! {
            _ = wait_closed(close.as_ref()) => {
                debug!(?peer, "connection closed by registry");
                return;
            }
            ready = transport.get_ref().readable() => {
                if let Err(e) = ready {
                    warn!(?peer, error = %e, "readiness wait failed");
                    return;
                }
            }
        }
    }
}

/// Dispatches one record and writes its reply. Reply messages, decode
/// failures and unusable replies are dropped; only transport failures are
/// returned.
async fn serve_record<C: CallCodec>(
    transport: &mut StreamTransport<TcpStream>,
    record: Bytes,
    codec: &C,
    dispatcher: &dyn Dispatch,
    counters: &Counters,
) -> Result<()> {
    if Direction::of(&record) == Some(Direction::Reply) {
        debug!(peer = ?transport.peer(), "dropping reply sent to a server");
        counters.total_dropped.fetch_add(1, Ordering::SeqCst);
        return Ok(());
    }
    let header = match codec.decode_call(&record) {
        Ok(header) => header,
        Err(e) => {
            debug!(peer = ?transport.peer(), error = %e, "dropping undecodable record");
            counters.total_dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
    };
    let guard = match transport.registration() {
        Some(registration) => Some(registration.begin_dispatch().ok_or(RpcError::Disconnected)?),
        None => None,
    };

    let reply = {
        let _active = ActiveRequest::enter(&counters.active_requests);
        let (tx, pending) = reply_channel(header.xid);
        dispatcher.dispatch(
            CallContext {
                header,
                request: record,
                peer: transport.peer(),
            },
            tx,
        );
        pending.recv().await
    };

    if let Some(reply) = reply {
        match bind_reply_xid(reply, header.xid) {
            Ok(reply) => {
                transport.queue_reply(&reply)?;
                while !transport.flush()? {
                    transport.get_ref().writable().await?;
                }
                counters.total_processed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(xid = header.xid, error = %e, "dropping malformed reply");
                counters.total_dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    drop(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::new_cancel_pair;
    use crate::dispatch::ReplySender;
    use crate::message::{encode_accepted_reply, encode_call, read_xid};
    use crate::record::{RecordReader, RecordWriter};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn echo(call: CallContext, reply: ReplySender) {
        reply.send(encode_accepted_reply(call.header.xid, call.args()));
    }

    async fn read_reply(stream: &mut TcpStream) -> Bytes {
        let mut reader = RecordReader::new(1 << 20, 4096);
        let mut buf = [0u8; 4096];
        loop {
            if let Some(record) = reader.next_record().unwrap() {
                return record;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed connection");
            reader.extend_input(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_stream_echo_and_shutdown() {
        let server = Arc::new(RpcServer::new(TransportConfig::default(), echo).unwrap());
        let listener = server.bind_stream("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (token, handle) = new_cancel_pair();
        let srv = Arc::clone(&server);
        let running = tokio::spawn(async move { srv.serve_stream(listener, token).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let writer = RecordWriter::new(16);
        let call = encode_call(31, 1, 1, 1, b"echo me please");
        stream.write_all(&writer.encode(&call).unwrap()).await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(read_xid(&reply), Some(31));
        assert!(reply.ends_with(b"echo me please"));

        handle.cancel(crate::cancel::CancelReason::Shutdown);
        running.await.unwrap().unwrap();
        assert_eq!(server.stats().total_processed, 1);
    }

    #[tokio::test]
    async fn test_undecodable_record_does_not_kill_connection() {
        let server = Arc::new(RpcServer::new(TransportConfig::default(), echo).unwrap());
        let listener = server.bind_stream("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (token, handle) = new_cancel_pair();
        let srv = Arc::clone(&server);
        let running = tokio::spawn(async move { srv.serve_stream(listener, token).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let writer = RecordWriter::new(1024);
        stream
            .write_all(&writer.encode(b"\0\0\0\x01garbage").unwrap())
            .await
            .unwrap();
        let call = encode_call(2, 1, 1, 1, b"ok");
        stream.write_all(&writer.encode(&call).unwrap()).await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(read_xid(&reply), Some(2));
        assert_eq!(server.stats().total_dropped, 1);

        handle.cancel(crate::cancel::CancelReason::Shutdown);
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reply_record_skips_codec() {
        let decoded = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&decoded);
        let codec = move |message: &[u8]| {
            seen.fetch_add(1, Ordering::SeqCst);
            RpcMessageCodec.decode_call(message)
        };
        let server =
            Arc::new(RpcServer::with_codec(TransportConfig::default(), codec, echo).unwrap());
        let listener = server.bind_stream("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (token, handle) = new_cancel_pair();
        let srv = Arc::clone(&server);
        let running = tokio::spawn(async move { srv.serve_stream(listener, token).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let writer = RecordWriter::new(1024);
        let stray = encode_accepted_reply(3, b"not for you");
        stream.write_all(&writer.encode(&stray).unwrap()).await.unwrap();
        let call = encode_call(4, 1, 1, 1, b"real");
        stream.write_all(&writer.encode(&call).unwrap()).await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(read_xid(&reply), Some(4));
        assert_eq!(decoded.load(Ordering::SeqCst), 1);
        assert_eq!(server.stats().total_dropped, 1);

        handle.cancel(crate::cancel::CancelReason::Shutdown);
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_datagram_loop_counts_outcomes() {
        let server = Arc::new(RpcServer::new(TransportConfig::default(), echo).unwrap());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (token, handle) = new_cancel_pair();
        let srv = Arc::clone(&server);
        let running = tokio::spawn(async move { srv.serve_datagram(socket, token).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"xx", addr).await.unwrap();
        let call = encode_call(11, 1, 1, 1, b"d");
        client.send_to(&call, addr).await.unwrap();
        let mut buf = [0u8; 512];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(read_xid(&buf[..n]), Some(11));

        handle.cancel(crate::cancel::CancelReason::Shutdown);
        running.await.unwrap().unwrap();
        let stats = server.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_dropped, 1);
        assert_eq!(stats.connections, 0);
    }
}
