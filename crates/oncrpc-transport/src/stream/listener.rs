//! Rendezvous transport: accepts connections and hands out stream
//! transports.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{is_descriptor_exhaustion, Result, RpcError};
use crate::registry::{ConnectionKind, ConnectionRegistry, Registration};
use crate::stream::connection::StreamTransport;

/// Longest wait for an evicted connection's owner to drop its socket.
pub const EVICTION_GRACE: Duration = Duration::from_millis(500);

/// Runs `attempt`; if it fails with descriptor exhaustion, asks the registry
/// to evict its least recently active connection, waits for that connection
/// to be dropped, and tries exactly once more.
pub async fn accept_with_eviction<T, F, Fut>(
    registry: &ConnectionRegistry,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    match attempt().await {
        Ok(value) => Ok(value),
        Err(e) if is_descriptor_exhaustion(&e) => {
            warn!(error = %e, "descriptor exhaustion on accept");
            if registry.evict_for_capacity(EVICTION_GRACE).await == 0 {
                return Err(RpcError::from_io(e));
            }
            attempt().await.map_err(RpcError::from_io)
        }
        Err(e) => Err(RpcError::Io(e)),
    }
}

/// A listening socket registered as a rendezvous transport.
#[derive(Debug)]
pub struct StreamListener {
    listener: TcpListener,
    config: TransportConfig,
    registry: Arc<ConnectionRegistry>,
    registration: Registration,
}

impl StreamListener {
    /// Binds a listener and registers it.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        config: TransportConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await.map_err(RpcError::from_io)?;
        Self::from_listener(listener, config, registry)
    }

    /// Registers an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: TransportConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let local = listener.local_addr()?;
        let registration = registry.register(ConnectionKind::Listener, Some(local));
        info!(addr = %local, "stream listener bound");
        Ok(Self {
            listener,
            config,
            registry,
            registration,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Configuration inherited by accepted transports.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Registry the accepted transports are registered in.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Registry entry of the listener itself.
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Waits for the next connection and returns it as a registered stream
    /// transport. Reaps connections idle beyond `idle_timeout` first.
    pub async fn accept(&self) -> Result<StreamTransport<TcpStream>> {
        let (stream, peer) =
            accept_with_eviction(&self.registry, || self.listener.accept()).await?;
        self.registration.touch();
        if !self.config.idle_timeout.is_zero() {
            let reaped = self.registry.evict_idle(self.config.idle_timeout);
            if reaped > 0 {
                debug!(reaped, "reaped idle connections");
            }
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "could not set TCP_NODELAY");
        }
        let mut transport = StreamTransport::new(stream, &self.config, Some(peer));
        transport.attach(self.registry.register(ConnectionKind::Stream, Some(peer)));
        debug!(%peer, "connection accepted");
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn emfile() -> io::Error {
        io::Error::from_raw_os_error(libc::EMFILE)
    }

    /// Registers a stream whose owner task drops it once closed, the way a
    /// connection task does. The flag is set just before the drop.
    fn owned_victim(registry: &Arc<ConnectionRegistry>) -> Arc<AtomicBool> {
        let victim = registry.register(ConnectionKind::Stream, None);
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dropped);
        tokio::spawn(async move {
            victim.close_signal().clone().closed().await;
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
            drop(victim);
        });
        dropped
    }

    #[tokio::test]
    async fn test_exhaustion_evicts_and_retries_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dropped = owned_victim(&registry);
        let calls = AtomicUsize::new(0);

        let got = accept_with_eviction(&registry, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(emfile())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(got, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_runs_after_victim_is_dropped() {
        for _ in 0..100 {
            let registry = Arc::new(ConnectionRegistry::new());
            let dropped = owned_victim(&registry);
            let calls = AtomicUsize::new(0);
            let freed_on_retry = accept_with_eviction(&registry, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let freed = dropped.load(Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(emfile())
                    } else {
                        Ok(freed)
                    }
                }
            })
            .await
            .unwrap();
            assert!(freed_on_retry);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_without_victims_is_resource_exhausted() {
        let registry = Arc::new(ConnectionRegistry::new());
        let calls = AtomicUsize::new(0);
        let err = accept_with_eviction(&registry, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(emfile()) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::ResourceExhausted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_exhaustion_after_eviction() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _dropped = owned_victim(&registry);
        let calls = AtomicUsize::new(0);
        let err = accept_with_eviction(&registry, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(emfile()) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::ResourceExhausted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_accept_errors_pass_through() {
        let registry = Arc::new(ConnectionRegistry::new());
        let err = accept_with_eviction(&registry, || async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionAborted))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }

    #[tokio::test]
    async fn test_accept_registers_stream() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener =
            StreamListener::bind("127.0.0.1:0", TransportConfig::default(), registry.clone())
                .await
                .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(registry.len(), 1);

        let _client = TcpStream::connect(addr).await.unwrap();
        let transport = listener.accept().await.unwrap();
        assert!(transport.peer().is_some());
        assert_eq!(registry.len(), 2);
        drop(transport);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_reaps_idle_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let config = TransportConfig {
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let listener = StreamListener::bind("127.0.0.1:0", config, registry.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let stale = listener.accept().await.unwrap();
        let stale_id = stale.registration().unwrap().id();
        tokio::time::advance(Duration::from_secs(120)).await;

        let _c2 = TcpStream::connect(addr).await.unwrap();
        let fresh = listener.accept().await.unwrap();
        assert!(!registry.contains(stale_id));
        assert!(stale.registration().unwrap().close_signal().is_closed());
        assert!(registry.contains(fresh.registration().unwrap().id()));
    }
}
