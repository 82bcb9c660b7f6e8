//! Server-side registry of live transports.
//!
//! The registry is the single authority that decides when a server
//! connection goes away. The task driving a connection holds a
//! [`Registration`]; the registry asks it to shut down through a
//! [`CloseSignal`] when the connection is evicted, and the registration
//! removes itself on drop. Ids carry a generation so that a stale handle can
//! never touch a slot that has since been reused.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Opaque, generation-tagged handle to a registered transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

/// What a registered transport does. Only `Stream` is ever evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Rendezvous transport accepting new connections.
    Listener,
    /// Connected byte stream carrying records.
    Stream,
    /// Connectionless socket.
    Datagram,
}

struct SignalState {
    closed: AtomicBool,
    released: AtomicBool,
    notify: Notify,
}

/// Tells the task that owns a transport to tear it down.
#[derive(Clone)]
pub struct CloseSignal {
    state: Arc<SignalState>,
}

impl CloseSignal {
    fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                closed: AtomicBool::new(false),
                released: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    fn fire(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    fn release(&self) {
        self.state.released.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Returns `true` once the registry has destroyed the transport.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Returns `true` once the owner has dropped its [`Registration`].
    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::SeqCst)
    }

    async fn wait_for(&self, flag: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if flag(self) {
                return;
            }
            notified.await;
        }
    }

    /// Completes once the registry destroys the transport.
    pub async fn closed(&self) {
        self.wait_for(Self::is_closed).await
    }

    /// Completes once the owner has dropped its [`Registration`], and with
    /// it the transport's socket.
    pub async fn released(&self) {
        self.wait_for(Self::is_released).await
    }
}

impl fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseSignal")
            .field("closed", &self.is_closed())
            .field("released", &self.is_released())
            .finish()
    }
}

struct Entry {
    kind: ConnectionKind,
    peer: Option<SocketAddr>,
    last_activity: Instant,
    in_flight: usize,
    doomed: bool,
    close: CloseSignal,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Inner {
    fn entry_mut(&mut self, id: ConnectionId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    fn live_entries(&self) -> impl Iterator<Item = (ConnectionId, &Entry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    ConnectionId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }
}

/// Point-in-time view of one registered transport.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Registry handle.
    pub id: ConnectionId,
    /// Transport role.
    pub kind: ConnectionKind,
    /// Remote address, when known.
    pub peer: Option<SocketAddr>,
    /// Time since the last successful read.
    pub idle: Duration,
    /// Dispatches currently running for this transport.
    pub in_flight: usize,
    /// Evicted, waiting for in-flight dispatches to finish.
    pub doomed: bool,
}

/// The set of live server transports, behind one coarse lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a transport. Dropping the returned registration removes it.
    pub fn register(
        self: &Arc<Self>,
        kind: ConnectionKind,
        peer: Option<SocketAddr>,
    ) -> Registration {
        let close = CloseSignal::new();
        let entry = Entry {
            kind,
            peer,
            last_activity: Instant::now(),
            in_flight: 0,
            doomed: false,
            close: close.clone(),
        };
        let mut inner = self.lock();
        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.entry = Some(entry);
                ConnectionId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ConnectionId {
                    index,
                    generation: 0,
                }
            }
        };
        inner.live += 1;
        drop(inner);
        debug!(%id, ?kind, ?peer, "transport registered");
        Registration {
            registry: Arc::clone(self),
            id,
            close,
        }
    }

    /// Removes a transport. Returns `false` if the id is stale.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(id);
        if let Some(entry) = &removed {
            entry.close.fire();
            debug!(%id, "transport unregistered");
        }
        removed.is_some()
    }

    /// Number of registered transports.
    pub fn len(&self) -> usize {
        self.lock().live
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `id` refers to a live transport.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entry_mut(id).is_some()
    }

    /// Records activity on a transport now.
    pub fn touch(&self, id: ConnectionId) {
        self.touch_at(id, Instant::now());
    }

    /// Records activity on a transport at `now`.
    pub fn touch_at(&self, id: ConnectionId, now: Instant) {
        if let Some(entry) = self.lock().entry_mut(id) {
            entry.last_activity = now;
        }
    }

    /// Time since the transport last saw activity.
    pub fn idle_time(&self, id: ConnectionId) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .entry_mut(id)
            .map(|entry| now.saturating_duration_since(entry.last_activity))
    }

    /// Marks a dispatch as running on the transport. Eviction of a transport
    /// with running dispatches is deferred until the last guard drops.
    /// Returns `None` if the transport is gone or already doomed.
    pub fn begin_dispatch(self: &Arc<Self>, id: ConnectionId) -> Option<DispatchGuard> {
        let mut inner = self.lock();
        let entry = inner.entry_mut(id)?;
        if entry.doomed {
            return None;
        }
        entry.in_flight += 1;
        Some(DispatchGuard {
            registry: Arc::clone(self),
            id,
        })
    }

    fn end_dispatch(&self, id: ConnectionId) {
        let mut inner = self.lock();
        let Some(entry) = inner.entry_mut(id) else {
            return;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.in_flight == 0 && entry.doomed {
            if let Some(entry) = inner.remove(id) {
                entry.close.fire();
                info!(%id, peer = ?entry.peer, "deferred eviction completed");
            }
        }
    }

    /// Evicts idle stream transports. See [`evict_idle_at`](Self::evict_idle_at).
    pub fn evict_idle(&self, threshold: Duration) -> usize {
        self.evict_idle_at(threshold, Instant::now())
    }

    /// Evicts idle stream transports as of `now`.
    ///
    /// With a non-zero `threshold`, every stream transport idle for longer
    /// than `threshold` is destroyed. With a zero `threshold` (resource
    /// pressure), exactly one is destroyed: the least recently active
    /// transport that has no dispatch running. Transports with running
    /// dispatches are doomed instead and go away when the last dispatch
    /// finishes. Listener and datagram transports are never evicted.
    /// Returns how many transports were destroyed or doomed.
    pub fn evict_idle_at(&self, threshold: Duration, now: Instant) -> usize {
        self.evict(threshold, now).0
    }

    /// Forcibly evicts the least recently active idle stream and waits up to
    /// `grace` for its owner to drop it. Returns how many transports were
    /// evicted; zero means there was nothing to free.
    pub async fn evict_for_capacity(&self, grace: Duration) -> usize {
        let (evicted, signals) = self.evict(Duration::ZERO, Instant::now());
        for signal in signals {
            if tokio::time::timeout(grace, signal.released()).await.is_err() {
                warn!(?grace, "evicted transport still held by its owner");
            }
        }
        evicted
    }

    /// Returns the number of transports destroyed or doomed, and the close
    /// signals of those destroyed right away.
    fn evict(&self, threshold: Duration, now: Instant) -> (usize, Vec<CloseSignal>) {
        let mut inner = self.lock();
        let victims: Vec<(ConnectionId, bool)> = if threshold.is_zero() {
            inner
                .live_entries()
                .filter(|(_, e)| e.kind == ConnectionKind::Stream && !e.doomed && e.in_flight == 0)
                .max_by_key(|(_, e)| now.saturating_duration_since(e.last_activity))
                .map(|(id, _)| (id, false))
                .into_iter()
                .collect()
        } else {
            inner
                .live_entries()
                .filter(|(_, e)| {
                    e.kind == ConnectionKind::Stream
                        && !e.doomed
                        && now.saturating_duration_since(e.last_activity) > threshold
                })
                .map(|(id, e)| (id, e.in_flight > 0))
                .collect()
        };

        let mut destroyed = Vec::new();
        for &(id, busy) in &victims {
            if busy {
                if let Some(entry) = inner.entry_mut(id) {
                    entry.doomed = true;
                    info!(%id, peer = ?entry.peer, "idle transport busy, eviction deferred");
                }
            } else if let Some(entry) = inner.remove(id) {
                entry.close.fire();
                let idle = now.saturating_duration_since(entry.last_activity);
                info!(
                    %id,
                    peer = ?entry.peer,
                    idle_ms = idle.as_millis() as u64,
                    "evicted idle transport"
                );
                destroyed.push(entry.close);
            }
        }
        (victims.len(), destroyed)
    }

    /// Snapshot of every registered transport.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        self.lock()
            .live_entries()
            .map(|(id, e)| ConnectionInfo {
                id,
                kind: e.kind,
                peer: e.peer,
                idle: now.saturating_duration_since(e.last_activity),
                in_flight: e.in_flight,
                doomed: e.doomed,
            })
            .collect()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("live", &self.len())
            .finish()
    }
}

/// Keeps a transport registered for as long as it lives.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    close: CloseSignal,
}

impl Registration {
    /// Handle of this transport.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Signal fired when the registry destroys this transport.
    pub fn close_signal(&self) -> &CloseSignal {
        &self.close
    }

    /// The registry this transport belongs to.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Records activity now.
    pub fn touch(&self) {
        self.registry.touch(self.id);
    }

    /// See [`ConnectionRegistry::begin_dispatch`].
    pub fn begin_dispatch(&self) -> Option<DispatchGuard> {
        self.registry.begin_dispatch(self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
        self.close.release();
    }
}

/// A running dispatch; see [`ConnectionRegistry::begin_dispatch`].
#[derive(Debug)]
pub struct DispatchGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.registry.end_dispatch(self.id);
    }
}
